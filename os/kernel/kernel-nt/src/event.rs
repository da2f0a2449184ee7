use core::sync::atomic::{AtomicBool, Ordering};

/// Outcome of [`NtKernel::wait_for_event`](crate::NtKernel::wait_for_event).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    /// `STATUS_SUCCESS`: the event was signaled.
    Signaled,
    /// `STATUS_TIMEOUT`.
    Timeout,
}

/// A notification event (`KEVENT` of `NotificationEvent` type).
///
/// Signaling is lock-free and allowed at any IRQL; waiting is done by the
/// kernel. Once set the event stays set until [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct Event {
    signaled: AtomicBool,
}

impl Event {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
        }
    }

    /// `KeSetEvent`.
    #[inline]
    pub fn set(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    /// `KeResetEvent`.
    #[inline]
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// `KeReadStateEvent`.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}
