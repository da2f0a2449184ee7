use kernel_nt::KernelError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MpError {
    /// The id can never name a processor on this system.
    #[error("CPU not found")]
    CpuNotFound,
    /// The processor exists but is not online (right now).
    #[error("CPU offline")]
    CpuOffline,
    #[error("not all CPUs responded")]
    NotAllCpusResponded,
    #[error("not supported by this kernel")]
    NotSupported,
    #[error("invalid parameter")]
    InvalidParameter,
    /// The work for the target processor was withdrawn before it ran.
    #[error("timed out waiting for the target CPU")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("internal error")]
    InternalError,
    #[error("processor count {0} is not supported")]
    TooManyCpus(u32),
    #[error("inconsistent processor topology: {0}")]
    TopologyInconsistent(&'static str),
    #[error("active processor count did not settle")]
    TopologyUnstable,
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
