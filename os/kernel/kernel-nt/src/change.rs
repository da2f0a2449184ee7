use crate::{KernelError, ProcessorNumber};

/// `KE_PROCESSOR_CHANGE_NOTIFY_STATE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessorChangeState {
    /// A processor is about to be added. Failing the callback vetoes the add.
    StartAdd,
    /// The processor is now active.
    AddCompleted,
    /// The add was aborted after [`StartAdd`](Self::StartAdd).
    AddFailed,
}

/// `KE_PROCESSOR_CHANGE_NOTIFY_CONTEXT`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcessorChangeContext {
    pub state: ProcessorChangeState,
    /// Processor index the kernel assigned (`NtNumber`).
    pub index: u32,
    pub number: ProcessorNumber,
}

/// Receiver of processor hot-add notifications.
pub trait ProcessorChangeCallback: Send + Sync {
    /// # Errors
    /// Returning an error during [`ProcessorChangeState::StartAdd`] fails
    /// the processor add; the result is ignored in the other states.
    fn on_processor_change(&self, context: &ProcessorChangeContext) -> Result<(), KernelError>;
}

/// Handle returned by `KeRegisterProcessorChangeCallback`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ChangeRegistration(pub u64);
