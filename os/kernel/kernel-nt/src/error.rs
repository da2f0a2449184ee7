/// `NTSTATUS` failures surfaced by [`NtKernel`](crate::NtKernel) methods.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// The export is not available on this kernel (`STATUS_NOT_SUPPORTED`).
    #[error("kernel entry point not available")]
    NotSupported,
    /// `STATUS_INVALID_PARAMETER`.
    #[error("invalid parameter")]
    InvalidParameter,
    /// `STATUS_INSUFFICIENT_RESOURCES`.
    #[error("insufficient resources")]
    InsufficientResources,
    /// `STATUS_UNSUCCESSFUL`.
    #[error("unsuccessful")]
    Unsuccessful,
}
