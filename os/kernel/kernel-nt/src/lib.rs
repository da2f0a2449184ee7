//! # NT Kernel Surface
//!
//! The MP dispatch engine and the timer engine never talk to `ntoskrnl` or
//! the HAL directly. Everything they consume from the host kernel is routed
//! through the [`NtKernel`] trait defined here, together with the handful of
//! plain data types those entry points exchange.
//!
//! ## Why a trait
//!
//! The set of kernel exports differs between kernel generations: processor
//! groups only exist from Windows 7 on, `KeIpiGenericCall` from Vista on,
//! `HalRequestIpi` changed its calling convention with Windows 7, and the
//! `ExAllocateTimer` family only exists from Windows 8.1 on. The actual
//! driver binding resolves those exports at load time and reports them via
//! [`EntryPoints`]; consumers pick their strategy from that bitfield once and
//! never look at the kernel version again.
//!
//! The same trait is implemented by the `kernel-nt-sim` crate, which runs
//! the whole engine on host threads for testing.
//!
//! ## Contents
//!
//! * [`Irql`] - interrupt request levels (`PASSIVE_LEVEL` .. `HIGH_LEVEL`)
//! * [`ProcessorNumber`], [`GroupInfo`], [`GroupRelationship`], [`AffinityEx`] - topology data
//! * [`Dpc`], [`DpcImportance`] - deferred procedure call objects
//! * [`Event`], [`WaitStatus`] - notification events for blocking waits
//! * [`KernelTimer`] - `KTIMER` / `EX_TIMER` objects
//! * [`ProcessorChangeCallback`] - hot-add notifications
//! * [`KernelError`] - `NTSTATUS` failures the engine cares about

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod change;
mod dpc;
mod entry_points;
mod error;
mod event;
mod irql;
mod processor;
mod timer;

use alloc::boxed::Box;
use alloc::sync::Arc;

pub use change::{ChangeRegistration, ProcessorChangeCallback, ProcessorChangeContext, ProcessorChangeState};
pub use dpc::{Dpc, DpcImportance};
pub use entry_points::EntryPoints;
pub use error::KernelError;
pub use event::{Event, WaitStatus};
pub use irql::Irql;
pub use processor::{
    AffinityEx, GroupInfo, GroupRelationship, MAXIMUM_PROC_PER_GROUP, ProcessorNumber,
};
pub use timer::KernelTimer;

/// Opaque identity of a kernel thread (`PsGetCurrentThread`).
///
/// Zero never identifies a live thread.
pub type ThreadId = u64;

/// No thread.
pub const NIL_THREAD: ThreadId = 0;

/// Nanoseconds per NT time unit (100 ns).
pub const NS_PER_NT_TICK: u64 = 100;

/// The host kernel as seen by the MP and timer engines.
///
/// Methods map one-to-one onto kernel or HAL exports. Optional exports are
/// described by [`entry_points`](Self::entry_points); calling a method whose
/// entry point is absent returns [`KernelError::NotSupported`] (or a neutral
/// value where the export has no status).
pub trait NtKernel: Send + Sync {
    /// Which optional exports the running kernel provides.
    fn entry_points(&self) -> EntryPoints;

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    /// `KeQueryMaximumGroupCount`; 1 on kernels without processor groups.
    fn maximum_group_count(&self) -> u16;

    /// `KeQueryMaximumProcessorCountEx(ALL_PROCESSOR_GROUPS)`.
    fn maximum_processor_count(&self) -> u32;

    /// `KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS)`.
    fn active_processor_count(&self) -> u32;

    /// `KeQueryActiveProcessors`: the legacy single-group active mask.
    fn active_processors(&self) -> u64;

    /// `KeQueryLogicalProcessorRelationship(NULL, RelationGroup, ...)`.
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] without processor groups.
    fn group_relationship(&self) -> Result<GroupRelationship, KernelError>;

    /// `KeGetProcessorIndexFromNumber`; `None` for processors not present.
    fn processor_index_from_number(&self, number: ProcessorNumber) -> Option<u32>;

    /// `KeGetProcessorNumberFromIndex`; `None` for indices not assigned yet.
    fn processor_number_from_index(&self, index: u32) -> Option<ProcessorNumber>;

    /// `KeGetCurrentProcessorNumberEx`.
    fn current_processor_number(&self) -> ProcessorNumber;

    /// `KeGetCurrentProcessorIndex`.
    fn current_processor_index(&self) -> u32;

    /// `PsGetCurrentThread`.
    fn current_thread(&self) -> ThreadId;

    // ------------------------------------------------------------------
    // IRQL
    // ------------------------------------------------------------------

    fn current_irql(&self) -> Irql;

    /// `KeRaiseIrql`; returns the previous level.
    fn raise_irql(&self, new_irql: Irql) -> Irql;

    /// `KeLowerIrql`.
    fn lower_irql(&self, old_irql: Irql);

    // ------------------------------------------------------------------
    // Deferred procedure calls
    // ------------------------------------------------------------------

    /// `KeSetTargetProcessorDpcEx`.
    ///
    /// # Errors
    /// [`KernelError::InvalidParameter`] if `number` is not a present processor.
    fn set_target_processor_dpc(&self, dpc: &Dpc, number: ProcessorNumber) -> Result<(), KernelError>;

    /// `KeInsertQueueDpc`; `false` if the DPC was already queued.
    ///
    /// The queue keeps a reference to `dpc` until the routine has been
    /// dispatched or the DPC is removed again.
    fn insert_queue_dpc(&self, dpc: &Arc<Dpc>) -> bool;

    /// `KeRemoveQueueDpc`; `false` if the DPC was not queued (or already running).
    fn remove_queue_dpc(&self, dpc: &Dpc) -> bool;

    /// `KeFlushQueuedDpcs`: returns once every DPC queued before the call has
    /// finished executing. Requires `PASSIVE_LEVEL`.
    fn flush_queued_dpcs(&self);

    // ------------------------------------------------------------------
    // Interprocessor interrupts
    // ------------------------------------------------------------------

    /// `KeIpiGenericCall`: runs `f` on every active processor at `IPI_LEVEL`
    /// and returns once all of them are done.
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] when the export is missing.
    fn ipi_generic_call(&self, f: &(dyn Fn() + Sync)) -> Result<(), KernelError>;

    /// `HalRequestIpi(0, PKAFFINITY_EX)` (Windows 7 and later).
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] when the export is missing.
    fn hal_request_ipi_w7_plus(&self, targets: &AffinityEx) -> Result<(), KernelError>;

    /// `HalRequestIpi(KAFFINITY)` (before Windows 7).
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] when the export is missing.
    fn hal_request_ipi_pre_w7(&self, targets: u64) -> Result<(), KernelError>;

    // ------------------------------------------------------------------
    // Waiting and time
    // ------------------------------------------------------------------

    /// `KeWaitForSingleObject` on a notification event. `None` waits forever.
    fn wait_for_event(&self, event: &Event, timeout_ns: Option<u64>) -> WaitStatus;

    /// `KeQueryInterruptTimePrecise` (falling back to `KeQueryInterruptTime`),
    /// scaled to nanoseconds.
    fn interrupt_time_ns(&self) -> u64;

    /// `KeStallExecutionProcessor`.
    fn stall_execution(&self, ns: u64);

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// `KeQueryTimeIncrement`, in nanoseconds.
    fn time_increment_ns(&self) -> u64;

    /// `ExSetTimerResolution`; returns the resolution now in effect (ns).
    fn set_timer_resolution(&self, ns: u64, set: bool) -> u64;

    /// `KeInitializeTimerEx` bound to `dpc`: on expiry the DPC is queued.
    fn create_timer(&self, dpc: Arc<Dpc>) -> Box<dyn KernelTimer>;

    /// `ExAllocateTimer(..., EX_TIMER_HIGH_RESOLUTION)`: on expiry `callback`
    /// runs at `DISPATCH_LEVEL` on an arbitrary processor.
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] when the export is missing,
    /// [`KernelError::InsufficientResources`] when allocation fails.
    fn allocate_high_resolution_timer(
        &self,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Box<dyn KernelTimer>, KernelError>;

    // ------------------------------------------------------------------
    // Processor hot-add
    // ------------------------------------------------------------------

    /// `KeRegisterProcessorChangeCallback`. Invocations are serialized.
    ///
    /// # Errors
    /// [`KernelError::NotSupported`] when the export is missing.
    fn register_processor_change_callback(
        &self,
        callback: Arc<dyn ProcessorChangeCallback>,
    ) -> Result<ChangeRegistration, KernelError>;

    /// `KeDeregisterProcessorChangeCallback`.
    fn deregister_processor_change_callback(&self, registration: ChangeRegistration);

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// `DbgPrint`-style output; `text` is emitted verbatim.
    fn dbg_print(&self, text: &str);
}
