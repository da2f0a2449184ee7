use kernel_mp::MpError;
use kernel_nt::KernelError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer is already active")]
    Active,
    /// Informational: the timer was not running.
    #[error("timer is already suspended")]
    Suspended,
    #[error("CPU not found")]
    CpuNotFound,
    #[error("CPU offline")]
    CpuOffline,
    #[error("invalid timer flags")]
    InvalidFlags,
    /// Called from the timer's own callback where that is not allowed.
    #[error("not allowed from the timer callback")]
    InvalidContext,
    #[error("timer was destroyed")]
    InvalidHandle,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("not supported by this kernel")]
    NotSupported,
    #[error("out of memory")]
    NoMemory,
    #[error(transparent)]
    Mp(#[from] MpError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
