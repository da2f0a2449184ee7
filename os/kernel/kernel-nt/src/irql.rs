/// Interrupt request level.
///
/// Values follow the AMD64 layout of `wdm.h`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Irql(pub u8);

impl Irql {
    pub const PASSIVE: Self = Self(0);
    pub const APC: Self = Self(1);
    /// DPCs run here; the scheduler cannot preempt or migrate the thread.
    pub const DISPATCH: Self = Self(2);
    pub const CLOCK: Self = Self(13);
    /// `KeIpiGenericCall` workers run here.
    pub const IPI: Self = Self(14);
    pub const HIGH: Self = Self(15);

    /// Whether a thread at this level may block on a dispatcher object.
    #[inline]
    #[must_use]
    pub const fn can_block(self) -> bool {
        self.0 < Self::DISPATCH.0
    }
}
