use crate::ProcessorNumber;
use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

/// `KDPC_IMPORTANCE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DpcImportance {
    Low = 0,
    #[default]
    Medium = 1,
    /// Queued at the head; on a remote processor this requests an IPI.
    High = 2,
    MediumHigh = 3,
}

impl DpcImportance {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::MediumHigh,
            _ => Self::Medium,
        }
    }
}

/// A deferred procedure call object (`KDPC`).
///
/// The routine is fixed at construction (`KeInitializeDpc`); any context it
/// needs is captured by the closure. The object can be queued again once
/// the previous dispatch has started, like its kernel counterpart: the
/// inserted flag is cleared before the routine runs.
pub struct Dpc {
    routine: Box<dyn Fn() + Send + Sync>,
    target: AtomicU32,
    importance: AtomicU8,
    inserted: AtomicBool,
}

impl Dpc {
    pub fn new(routine: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            routine: Box::new(routine),
            target: AtomicU32::new(ProcessorNumber::NIL_BITS),
            importance: AtomicU8::new(DpcImportance::Medium as u8),
            inserted: AtomicBool::new(false),
        }
    }

    /// Target processor, `None` for "the processor that queues it".
    #[inline]
    #[must_use]
    pub fn target(&self) -> Option<ProcessorNumber> {
        ProcessorNumber::from_packed(self.target.load(Ordering::Acquire))
    }

    /// Records a validated target. Kernel implementations call this from
    /// [`NtKernel::set_target_processor_dpc`](crate::NtKernel::set_target_processor_dpc).
    #[inline]
    pub fn bind_target(&self, number: ProcessorNumber) {
        self.target.store(number.into_bits(), Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn importance(&self) -> DpcImportance {
        DpcImportance::from_u8(self.importance.load(Ordering::Relaxed))
    }

    /// `KeSetImportanceDpc`.
    #[inline]
    pub fn set_importance(&self, importance: DpcImportance) {
        self.importance.store(importance as u8, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }

    /// Claims the inserted flag; `false` if the DPC is already queued.
    #[inline]
    pub fn mark_inserted(&self) -> bool {
        !self.inserted.swap(true, Ordering::AcqRel)
    }

    /// Releases the inserted flag; `false` if it was not set.
    #[inline]
    pub fn mark_removed(&self) -> bool {
        self.inserted.swap(false, Ordering::AcqRel)
    }

    /// Runs the deferred routine on the current processor.
    #[inline]
    pub fn invoke(&self) {
        (self.routine)();
    }
}

impl fmt::Debug for Dpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dpc")
            .field("target", &self.target())
            .field("importance", &self.importance())
            .field("inserted", &self.is_inserted())
            .finish_non_exhaustive()
    }
}
