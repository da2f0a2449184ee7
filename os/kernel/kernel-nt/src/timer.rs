/// A kernel timer object (`KTIMER` or high-resolution `EX_TIMER`).
///
/// Timers are always one-shot at this level; periodic behavior is built on
/// top by re-arming from the expiry routine. Dropping the object cancels it
/// (`KeCancelTimer` / `ExDeleteTimer`).
pub trait KernelTimer: Send + Sync {
    /// Arms the timer to expire `due_ns` nanoseconds from now, replacing any
    /// pending expiry. Returns `true` if the timer was already pending.
    fn set_relative(&self, due_ns: u64) -> bool;

    /// Cancels a pending expiry. Returns `true` if one was pending.
    fn cancel(&self) -> bool;

    /// Whether this is a high-resolution timer.
    fn is_high_resolution(&self) -> bool;
}
