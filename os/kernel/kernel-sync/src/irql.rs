use kernel_nt::{Irql, NtKernel};

/// RAII guard that raises the IRQL on creation and lowers it on drop.
///
/// `IrqlGuard::raise(k, Irql::DISPATCH)` is the kernel's way of pinning a
/// thread: at `DISPATCH_LEVEL` the scheduler neither preempts nor migrates
/// it, so the current processor stays current until the guard is dropped.
///
/// Raising to a level at or below the current one is a no-op, so guards can
/// be taken unconditionally from code that may already run at
/// `DISPATCH_LEVEL` (DPC routines, for instance).
///
/// # Examples
///
/// ```no_run
/// # fn demo(kernel: &dyn kernel_nt::NtKernel) {
/// use kernel_nt::Irql;
/// use kernel_sync::IrqlGuard;
///
/// let before = kernel.current_irql();
/// {
///     let _pin = IrqlGuard::raise(kernel, Irql::DISPATCH);
///     let cpu = kernel.current_processor_index(); // stable until the guard drops
///     # let _ = cpu;
/// }
/// assert_eq!(kernel.current_irql(), before);
/// # }
/// ```
#[must_use = "dropping the guard lowers the IRQL immediately"]
pub struct IrqlGuard<'k> {
    kernel: &'k dyn NtKernel,
    /// The level to go back to, or `None` if nothing was raised.
    old: Option<Irql>,
}

impl<'k> IrqlGuard<'k> {
    /// Raises to `to` unless already at or above it.
    #[inline]
    pub fn raise(kernel: &'k dyn NtKernel, to: Irql) -> Self {
        if kernel.current_irql() >= to {
            return Self { kernel, old: None };
        }
        let old = kernel.raise_irql(to);
        Self {
            kernel,
            old: Some(old),
        }
    }
}

impl Drop for IrqlGuard<'_> {
    fn drop(&mut self) {
        if let Some(old) = self.old {
            self.kernel.lower_irql(old);
        }
    }
}
