//! # Multiprocessor runtime
//!
//! Processor topology and cross-CPU execution on top of the NT kernel
//! surface ([`kernel_nt::NtKernel`]).
//!
//! ## Processor ids
//!
//! Every logical processor the system may ever host has a dense *set index*
//! in `0..max_cpus`, and its [`CpuId`] is that index. Processors that are
//! online use the index the kernel assigned them (`KeGetProcessorIndexFromNumber`);
//! members of a processor group that have not shown up yet are given
//! placeholder indices from the top of the range, swapped for the real one
//! when the processor is hot-added. Indices never change once a processor is
//! online.
//!
//! ## Running code elsewhere
//!
//! | call | runs the worker on |
//! |------|--------------------|
//! | [`Mp::on_all`] | every online processor |
//! | [`Mp::on_others`] | every online processor but the caller's |
//! | [`Mp::on_specific`] | one processor |
//! | [`Mp::on_pair`] | exactly two processors, optionally at the same time |
//! | [`Mp::poke_cpu`] | nothing; just interrupts the processor |
//!
//! The mechanism is picked once from the kernel's [`EntryPoints`](kernel_nt::EntryPoints)
//! ([`DispatchStrategy`], [`PokeStrategy`]); callers never look at the
//! kernel version. Workers run at `IPI_LEVEL` (broadcast) or
//! `DISPATCH_LEVEL` (DPCs) and must not block.
//!
//! ```no_run
//! # fn demo(kernel: std::sync::Arc<dyn kernel_nt::NtKernel>) -> Result<(), kernel_mp::MpError> {
//! use core::sync::atomic::{AtomicU32, Ordering};
//! use kernel_mp::Mp;
//! use std::sync::Arc;
//!
//! let mp = Mp::init(kernel)?;
//! let visits = Arc::new(AtomicU32::new(0));
//! let v = Arc::clone(&visits);
//! mp.on_all(move |_cpu| {
//!     v.fetch_add(1, Ordering::Relaxed);
//! })?;
//! assert_eq!(visits.load(Ordering::Relaxed), mp.online_count());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod cpuset;
mod dispatch;
mod error;
mod notify;
mod poke;
mod strategy;
mod topology;

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_nt::{
    ChangeRegistration, Dpc, DpcImportance, KernelError, NtKernel, ProcessorChangeCallback,
    ProcessorChangeContext, ProcessorChangeState, ProcessorNumber,
};
use kernel_sync::KSpinLock;
use log::{debug, info, warn};
use topology::Topology;

pub use config::{MpConfig, SpecificWait};
pub use cpuset::{CPUSET_MAX_CPUS, CpuId, CpuSet};
pub use dispatch::PairFlags;
pub use error::MpError;
pub use notify::{MpEvent, MpNotifier, NotificationRegistration};
pub use strategy::{DispatchStrategy, PokeStrategy};

/// The MP runtime: topology registry plus dispatch engine.
///
/// Created once per driver with [`Mp::init`]; dropping the last reference
/// (or calling [`Mp::shutdown`]) unhooks the hot-plug callback.
pub struct Mp {
    kernel: Arc<dyn NtKernel>,
    config: MpConfig,
    topology: Topology,
    dispatch: DispatchStrategy,
    poke: PokeStrategy,
    /// One high-importance DPC per set index, for [`PokeStrategy::HighImportanceDpc`].
    poke_dpcs: Vec<Arc<Dpc>>,
    notifications: notify::Notifications,
    registration: KSpinLock<Option<ChangeRegistration>>,
}

struct HotPlug {
    mp: Weak<Mp>,
}

impl ProcessorChangeCallback for HotPlug {
    fn on_processor_change(&self, context: &ProcessorChangeContext) -> Result<(), KernelError> {
        match self.mp.upgrade() {
            Some(mp) => mp.on_processor_change(context),
            None => Ok(()),
        }
    }
}

impl Mp {
    /// [`Mp::with_config`] with the default configuration.
    ///
    /// # Errors
    /// See [`Mp::with_config`].
    pub fn init(kernel: Arc<dyn NtKernel>) -> Result<Arc<Self>, MpError> {
        Self::with_config(kernel, MpConfig::new())
    }

    /// Discovers the topology, selects strategies and registers for
    /// processor hot-add.
    ///
    /// A processor arriving between discovery and registration would go
    /// unnoticed, so discovery is repeated until the online count still
    /// matches the kernel's after registering; those rounds share
    /// [`MpConfig::discovery_attempts`] with discovery itself.
    ///
    /// # Errors
    /// Topology failures ([`MpError::TooManyCpus`],
    /// [`MpError::TopologyInconsistent`], [`MpError::TopologyUnstable`]),
    /// [`MpError::NoMemory`], or a kernel error from registration.
    pub fn with_config(kernel: Arc<dyn NtKernel>, config: MpConfig) -> Result<Arc<Self>, MpError> {
        let mut attempts = config.discovery_attempts;
        loop {
            let topology = Topology::discover(&*kernel, &config, &mut attempts)?;
            let mp = Arc::new(Self::assemble(Arc::clone(&kernel), config, topology)?);

            match mp.register_hot_plug() {
                Ok(()) => {}
                Err(KernelError::NotSupported) => debug!("no processor change callbacks; topology is static"),
                Err(e) => return Err(e.into()),
            }

            let active = kernel.active_processor_count();
            if active == mp.online_count() {
                info!(
                    "{} of {} CPUs online in {} group(s), dispatch {:?}, poke {:?}",
                    mp.online_count(),
                    mp.possible_count(),
                    mp.max_cpu_group_count(),
                    mp.dispatch,
                    mp.poke
                );
                return Ok(mp);
            }

            debug!(
                "{active} CPUs active after registration but {} discovered, rediscovering",
                mp.online_count()
            );
            mp.shutdown();
            if attempts == 0 {
                return Err(MpError::TopologyUnstable);
            }
        }
    }

    fn assemble(kernel: Arc<dyn NtKernel>, config: MpConfig, topology: Topology) -> Result<Self, MpError> {
        let entry_points = kernel.entry_points();
        let dispatch = DispatchStrategy::select(entry_points);
        let poke = PokeStrategy::select(entry_points, topology.max_cpus());

        let mut poke_dpcs = Vec::new();
        if poke == PokeStrategy::HighImportanceDpc {
            poke_dpcs
                .try_reserve_exact(topology.max_cpus() as usize)
                .map_err(|_| MpError::NoMemory)?;
            for _ in 0..topology.max_cpus() {
                let dpc = Dpc::new(|| {});
                dpc.set_importance(DpcImportance::High);
                poke_dpcs.push(Arc::new(dpc));
            }
        }

        Ok(Self {
            notifications: notify::Notifications::new(Arc::clone(&kernel)),
            registration: KSpinLock::new(Arc::clone(&kernel), None),
            kernel,
            config,
            topology,
            dispatch,
            poke,
            poke_dpcs,
        })
    }

    fn register_hot_plug(self: &Arc<Self>) -> Result<(), KernelError> {
        let callback = Arc::new(HotPlug {
            mp: Arc::downgrade(self),
        });
        let registration = self.kernel.register_processor_change_callback(callback)?;
        *self.registration.lock() = Some(registration);
        Ok(())
    }

    /// Stops listening for hot-added processors. Idempotent.
    pub fn shutdown(&self) {
        if let Some(registration) = self.registration.lock().take() {
            self.kernel.deregister_processor_change_callback(registration);
        }
    }

    fn on_processor_change(&self, context: &ProcessorChangeContext) -> Result<(), KernelError> {
        let number = context.number;
        match context.state {
            ProcessorChangeState::StartAdd => match self.topology.validate_add(context.index, number) {
                Ok(()) => {
                    info!(
                        "CPU {} (group {} member {}) arriving",
                        context.index,
                        number.group(),
                        number.number()
                    );
                    Ok(())
                }
                Err(why) => {
                    warn!("refusing hot-added CPU {}: {why}", context.index);
                    Err(KernelError::InvalidParameter)
                }
            },
            ProcessorChangeState::AddCompleted => {
                if self.topology.complete_add(context.index, number) {
                    info!("CPU {} online", context.index);
                    self.notifications.fire(MpEvent::Online, CpuId(context.index));
                } else {
                    warn!("completed add of CPU {} not accepted", context.index);
                }
                Ok(())
            }
            ProcessorChangeState::AddFailed => {
                debug!("add of CPU {} failed", context.index);
                Ok(())
            }
        }
    }

    /// The kernel this runtime sits on.
    #[inline]
    #[must_use]
    pub fn kernel(&self) -> &Arc<dyn NtKernel> {
        &self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MpConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn dispatch_strategy(&self) -> DispatchStrategy {
        self.dispatch
    }

    #[inline]
    #[must_use]
    pub const fn poke_strategy(&self) -> PokeStrategy {
        self.poke
    }

    // ------------------------------------------------------------------
    // Topology queries
    // ------------------------------------------------------------------

    /// The processor the caller runs on. Only stable while pinned.
    #[must_use]
    pub fn cpu_id(&self) -> CpuId {
        CpuId(self.kernel.current_processor_index())
    }

    #[must_use]
    pub fn cpu_set_index(&self) -> u32 {
        self.kernel.current_processor_index()
    }

    /// `None` outside the set-index space.
    #[must_use]
    pub const fn cpu_id_from_set_index(&self, index: u32) -> Option<CpuId> {
        if index < self.topology.max_cpus() {
            Some(CpuId(index))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn set_index_from_cpu_id(&self, id: CpuId) -> Option<u32> {
        if id.0 < self.topology.max_cpus() {
            Some(id.0)
        } else {
            None
        }
    }

    /// Set index of `member` in `group`; `None` for members beyond the
    /// index space or outside the topology.
    #[must_use]
    pub fn set_index_from_cpu_group_member(&self, group: u16, member: u32) -> Option<u32> {
        self.topology.index_from_group_member(group, member)
    }

    /// Group and member `id` currently maps to.
    #[must_use]
    pub fn processor_number_from_id(&self, id: CpuId) -> Option<ProcessorNumber> {
        self.topology.number_from_index(id.0)
    }

    /// `(maximum, active)` member counts of `group`.
    #[must_use]
    pub fn cpu_group_counts(&self, group: u16) -> Option<(u32, u32)> {
        self.topology.group_counts(group)
    }

    #[must_use]
    pub fn max_cpu_group_count(&self) -> u16 {
        self.topology.max_groups()
    }

    #[must_use]
    pub const fn max_cpu_id(&self) -> CpuId {
        CpuId(self.topology.max_cpus() - 1)
    }

    #[must_use]
    pub const fn is_cpu_possible(&self, id: CpuId) -> bool {
        id.0 < self.topology.max_cpus()
    }

    #[must_use]
    pub fn possible_set(&self) -> CpuSet {
        (0..self.topology.max_cpus()).map(CpuId).collect()
    }

    #[must_use]
    pub const fn possible_count(&self) -> u32 {
        self.topology.max_cpus()
    }

    #[must_use]
    pub fn is_cpu_online(&self, id: CpuId) -> bool {
        self.topology.is_online(id.0)
    }

    #[must_use]
    pub fn online_set(&self) -> CpuSet {
        self.topology.online_set()
    }

    #[must_use]
    pub fn online_count(&self) -> u32 {
        self.topology.online_count()
    }

    /// Whether the processor has queued deferred work. The kernel does not
    /// expose this, so the answer is always `false`.
    #[must_use]
    pub const fn is_cpu_work_pending(&self) -> bool {
        false
    }

    fn check_online(&self, id: CpuId) -> Result<(), MpError> {
        if !self.is_cpu_possible(id) {
            Err(MpError::CpuNotFound)
        } else if !self.is_cpu_online(id) {
            Err(MpError::CpuOffline)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Calls `notifier` whenever a processor comes online, after the
    /// topology has been updated.
    pub fn notification_register(&self, notifier: MpNotifier) -> NotificationRegistration {
        self.notifications.register(notifier)
    }

    /// Returns `false` if the registration was not found.
    pub fn notification_deregister(&self, registration: &NotificationRegistration) -> bool {
        self.notifications.deregister(registration)
    }
}

impl Drop for Mp {
    fn drop(&mut self) {
        self.shutdown();
    }
}
