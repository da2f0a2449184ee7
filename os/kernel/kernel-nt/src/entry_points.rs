use bitfield_struct::bitfield;

/// Optional kernel exports resolved when the driver was loaded.
///
/// Every flag corresponds to one or more `MmGetSystemRoutineAddress` lookups
/// that succeeded. Consumers select strategies from this once, at init.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EntryPoints {
    /// `KeQueryMaximumGroupCount`, `KeQueryLogicalProcessorRelationship`,
    /// `KeGetProcessorIndexFromNumber` and friends (Windows 7+).
    pub processor_groups: bool,
    /// `KeIpiGenericCall` (Vista+).
    pub ipi_generic_call: bool,
    /// `HalRequestIpi` with the `(ULONG, PKAFFINITY_EX)` prototype, plus
    /// `KeInitializeAffinityEx` and `KeAddProcessorAffinityEx`.
    pub hal_request_ipi_w7_plus: bool,
    /// `HalRequestIpi` with the `(KAFFINITY)` prototype.
    pub hal_request_ipi_pre_w7: bool,
    /// `KeRegisterProcessorChangeCallback`.
    pub processor_change_callback: bool,
    /// `ExAllocateTimer`, `ExSetTimer`, `ExCancelTimer`, `ExDeleteTimer`.
    pub high_resolution_timers: bool,
    /// A high-importance DPC queued to a remote processor raises an IPI.
    pub high_importance_dpc_ipi: bool,
    #[bits(25)]
    __: u32,
}

impl EntryPoints {
    /// What a current Windows 10/11 kernel exports.
    #[must_use]
    pub const fn modern() -> Self {
        Self::new()
            .with_processor_groups(true)
            .with_ipi_generic_call(true)
            .with_hal_request_ipi_w7_plus(true)
            .with_processor_change_callback(true)
            .with_high_resolution_timers(true)
            .with_high_importance_dpc_ipi(true)
    }

    /// A pre-Vista kernel: targeted DPCs are all there is.
    #[must_use]
    pub const fn legacy() -> Self {
        Self::new()
    }
}
