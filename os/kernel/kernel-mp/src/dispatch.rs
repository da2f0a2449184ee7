//! Cross-CPU execution.

use crate::{CpuId, DispatchStrategy, Mp, MpError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_nt::{Dpc, Event, Irql, NtKernel, WaitStatus};
use kernel_sync::IrqlGuard;
use log::{debug, error, warn};

/// Options of [`Mp::on_pair`].
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PairFlags {
    /// Both workers must run at the same time; only the broadcast strategy
    /// can promise that.
    pub concurrent_exec: bool,
    #[bits(31)]
    __: u32,
}

impl PairFlags {
    const VALID_MASK: u32 = 1;

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.into_bits() & !Self::VALID_MASK == 0
    }
}

/// Which processors a trampoline runs the worker on.
#[derive(Debug, Copy, Clone)]
enum Targets {
    All,
    Others(CpuId),
    One(CpuId),
    Pair(CpuId, CpuId),
}

impl Targets {
    fn includes(self, cpu: CpuId) -> bool {
        match self {
            Self::All => true,
            Self::Others(me) => cpu != me,
            Self::One(target) => cpu == target,
            Self::Pair(a, b) => cpu == a || cpu == b,
        }
    }
}

/// State shared by the initiator and every trampoline of one call.
struct MpCall<F> {
    worker: F,
    targets: Targets,
    kernel: Arc<dyn NtKernel>,
    hits: AtomicU32,
    /// Set by every trampoline after the worker returned.
    done: Event,
}

impl<F: Fn(CpuId)> MpCall<F> {
    fn new(kernel: &Arc<dyn NtKernel>, worker: F, targets: Targets) -> Self {
        Self {
            worker,
            targets,
            kernel: Arc::clone(kernel),
            hits: AtomicU32::new(0),
            done: Event::new(),
        }
    }

    fn execute(&self) {
        let cpu = CpuId(self.kernel.current_processor_index());
        if self.targets.includes(cpu) {
            (self.worker)(cpu);
            self.hits.fetch_add(1, Ordering::AcqRel);
            self.done.set();
        }
    }

    fn hits(&self) -> u32 {
        self.hits.load(Ordering::Acquire)
    }
}

impl Mp {
    /// Runs `worker` once on every online processor, the caller's included,
    /// and returns when all of them are done.
    ///
    /// # Errors
    /// [`MpError::NoMemory`] or a kernel failure; no worker has run then.
    pub fn on_all<F>(&self, worker: F) -> Result<(), MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        match self.dispatch {
            DispatchStrategy::BroadcastIpi => {
                let call = MpCall::new(&self.kernel, worker, Targets::All);
                self.kernel.ipi_generic_call(&|| call.execute())?;
                Ok(())
            }
            DispatchStrategy::TargetedDpc => self.on_all_dpc(worker, true),
        }
    }

    /// Like [`on_all`](Self::on_all) minus the calling processor.
    ///
    /// # Errors
    /// See [`on_all`](Self::on_all).
    pub fn on_others<F>(&self, worker: F) -> Result<(), MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        match self.dispatch {
            DispatchStrategy::BroadcastIpi => {
                let _pin = IrqlGuard::raise(&*self.kernel, Irql::DISPATCH);
                let call = MpCall::new(&self.kernel, worker, Targets::Others(self.cpu_id()));
                self.kernel.ipi_generic_call(&|| call.execute())?;
                Ok(())
            }
            DispatchStrategy::TargetedDpc => self.on_all_dpc(worker, false),
        }
    }

    /// Pinned: queue a DPC to every other online processor, run locally,
    /// then wait for the queues to drain.
    fn on_all_dpc<F>(&self, worker: F, include_self: bool) -> Result<(), MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let call = Arc::new(MpCall::new(&self.kernel, worker, Targets::All));
        let pin = IrqlGuard::raise(&*self.kernel, Irql::DISPATCH);
        let me = self.cpu_id();
        let online = self.online_set();

        let mut dpcs = Vec::new();
        dpcs.try_reserve_exact(online.count() as usize)
            .map_err(|_| MpError::NoMemory)?;
        for cpu in online.iter().filter(|&cpu| cpu != me) {
            dpcs.push(self.dpc_for(&call, cpu)?);
        }
        for dpc in &dpcs {
            self.kernel.insert_queue_dpc(dpc);
        }
        let mut expected = u32::try_from(dpcs.len()).map_err(|_| MpError::InternalError)?;
        if include_self && online.contains(me) {
            call.execute();
            expected += 1;
        }
        drop(pin);

        if self.drain(&call, &dpcs, expected) < expected {
            return Err(MpError::NotAllCpusResponded);
        }
        Ok(())
    }

    /// Runs `worker` on processor `id` and waits for it to finish.
    ///
    /// On the target already, the worker runs inline (pinned) without
    /// queuing anything. Otherwise a broadcast is used when available, or a
    /// DPC whose wait escalates as configured in [`SpecificWait`](crate::SpecificWait):
    /// spin, short wait, poke and wait, withdraw the DPC, and finally wait
    /// for good with an error logged every interval.
    ///
    /// # Errors
    /// * [`MpError::CpuNotFound`] if `id` is not possible.
    /// * [`MpError::CpuOffline`] if it is not online, or did not respond.
    /// * [`MpError::Timeout`] if the DPC was withdrawn before it ran.
    pub fn on_specific<F>(&self, id: CpuId, worker: F) -> Result<(), MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.check_online(id)?;

        if self.dispatch == DispatchStrategy::BroadcastIpi {
            let _pin = IrqlGuard::raise(&*self.kernel, Irql::DISPATCH);
            if self.cpu_id() == id {
                worker(id);
                return Ok(());
            }
            let call = MpCall::new(&self.kernel, worker, Targets::One(id));
            self.kernel.ipi_generic_call(&|| call.execute())?;
            return single_hit(call.hits());
        }

        let call = Arc::new(MpCall::new(&self.kernel, worker, Targets::One(id)));
        let dpc = self.dpc_for(&call, id)?;
        {
            let _pin = IrqlGuard::raise(&*self.kernel, Irql::DISPATCH);
            if self.cpu_id() == id {
                call.execute();
                return single_hit(call.hits());
            }
            self.kernel.insert_queue_dpc(&dpc);
        }
        self.await_specific(&call, &dpc, id)?;
        single_hit(call.hits())
    }

    fn await_specific<F>(&self, call: &MpCall<F>, dpc: &Dpc, id: CpuId) -> Result<(), MpError> {
        let wait = self.config.specific_wait;

        for _ in 0..wait.spin_iterations {
            if call.done.is_set() {
                return Ok(());
            }
            spin_loop();
        }

        if self.wait_event(&call.done, wait.short_wait_ns) {
            return Ok(());
        }

        debug!("{id} has not picked up its DPC, poking it");
        if let Err(e) = self.poke_cpu(id) {
            debug!("poking {id} failed: {e}");
        }
        if self.wait_event(&call.done, wait.poke_wait_ns) {
            return Ok(());
        }

        if self.kernel.remove_queue_dpc(dpc) {
            warn!("{id} never ran its DPC, withdrew it");
            return Err(MpError::Timeout);
        }

        // Dequeued, so it is running or about to; it has to be waited for.
        let mut waited_ns = wait.short_wait_ns + wait.poke_wait_ns;
        loop {
            if self.wait_event(&call.done, wait.give_up_interval_ns) {
                return Ok(());
            }
            waited_ns = waited_ns.saturating_add(wait.give_up_interval_ns);
            error!("still waiting for {id} after {} ms", waited_ns / 1_000_000);
        }
    }

    /// Runs `worker` on both `a` and `b`, and nowhere else.
    ///
    /// # Errors
    /// * [`MpError::InvalidParameter`] for `a == b` or reserved flag bits.
    /// * [`MpError::CpuNotFound`] / [`MpError::CpuOffline`] for either id.
    /// * [`MpError::NotSupported`] for concurrent execution without broadcast IPIs.
    /// * [`MpError::NotAllCpusResponded`] if only one of them ran the worker,
    ///   [`MpError::CpuOffline`] if neither did.
    pub fn on_pair<F>(&self, a: CpuId, b: CpuId, flags: PairFlags, worker: F) -> Result<(), MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        if a == b || !flags.is_valid() {
            return Err(MpError::InvalidParameter);
        }
        if !self.is_cpu_possible(a) || !self.is_cpu_possible(b) {
            return Err(MpError::CpuNotFound);
        }
        if !self.is_cpu_online(a) || !self.is_cpu_online(b) {
            return Err(MpError::CpuOffline);
        }
        if flags.concurrent_exec() && self.dispatch != DispatchStrategy::BroadcastIpi {
            return Err(MpError::NotSupported);
        }

        let hits = match self.dispatch {
            DispatchStrategy::BroadcastIpi => {
                let call = MpCall::new(&self.kernel, worker, Targets::Pair(a, b));
                self.kernel.ipi_generic_call(&|| call.execute())?;
                call.hits()
            }
            DispatchStrategy::TargetedDpc => {
                let call = Arc::new(MpCall::new(&self.kernel, worker, Targets::Pair(a, b)));
                let pin = IrqlGuard::raise(&*self.kernel, Irql::DISPATCH);
                let me = self.cpu_id();
                let mut dpcs = Vec::new();
                dpcs.try_reserve_exact(2).map_err(|_| MpError::NoMemory)?;
                for cpu in [a, b].into_iter().filter(|&cpu| cpu != me) {
                    dpcs.push(self.dpc_for(&call, cpu)?);
                }
                for dpc in &dpcs {
                    self.kernel.insert_queue_dpc(dpc);
                }
                if me == a || me == b {
                    call.execute();
                }
                drop(pin);
                self.drain(&call, &dpcs, 2)
            }
        };

        match hits {
            2 => Ok(()),
            1 => Err(MpError::NotAllCpusResponded),
            0 => Err(MpError::CpuOffline),
            _ => {
                debug_assert!(hits <= 2, "pair call ran {hits} times");
                Err(MpError::InternalError)
            }
        }
    }

    /// Whether [`on_all`](Self::on_all) may be called from several threads
    /// at once. Each call owns its argument block and DPCs, so it may.
    #[must_use]
    pub const fn on_all_is_concurrent_safe(&self) -> bool {
        true
    }

    /// Whether [`PairFlags::concurrent_exec`] can be honored.
    #[must_use]
    pub fn on_pair_is_concurrent_exec_supported(&self) -> bool {
        self.dispatch == DispatchStrategy::BroadcastIpi
    }

    fn dpc_for<F>(&self, call: &Arc<MpCall<F>>, cpu: CpuId) -> Result<Arc<Dpc>, MpError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let number = self.processor_number_from_id(cpu).ok_or(MpError::CpuOffline)?;
        let call = Arc::clone(call);
        let dpc = Arc::new(Dpc::new(move || call.execute()));
        self.kernel.set_target_processor_dpc(&dpc, number)?;
        Ok(dpc)
    }

    /// Waits for the DPCs of `call` and returns its hit count.
    ///
    /// Where the caller may block this is a queue flush; otherwise the hit
    /// count is polled for as long as a poked DPC gets in
    /// [`on_specific`](Self::on_specific). DPCs still queued after that are
    /// withdrawn, and the ones already running are waited for with an
    /// error logged every [`give_up_interval_ns`](crate::SpecificWait::give_up_interval_ns).
    fn drain<F: Fn(CpuId)>(&self, call: &MpCall<F>, dpcs: &[Arc<Dpc>], expected: u32) -> u32 {
        let wait = self.config.specific_wait;
        if self.kernel.current_irql().can_block() {
            self.kernel.flush_queued_dpcs();
        } else if self.wait_hits(call, expected, wait.short_wait_ns.saturating_add(wait.poke_wait_ns)) {
            return call.hits();
        }
        if call.hits() >= expected {
            return call.hits();
        }

        let withdrawn = dpcs.iter().filter(|dpc| self.kernel.remove_queue_dpc(dpc)).count();
        if withdrawn > 0 {
            warn!("withdrew {withdrawn} DPCs that never ran");
        }
        let running = expected.saturating_sub(u32::try_from(withdrawn).unwrap_or(u32::MAX));
        let mut waited_ns = 0u64;
        while !self.wait_hits(call, running, wait.give_up_interval_ns) {
            waited_ns = waited_ns.saturating_add(wait.give_up_interval_ns);
            error!(
                "still waiting for {} of {running} processors after {} ms",
                running.saturating_sub(call.hits()),
                waited_ns / 1_000_000
            );
        }
        call.hits()
    }

    /// Polls up to `ns` for `call` to reach `target` hits.
    fn wait_hits<F: Fn(CpuId)>(&self, call: &MpCall<F>, target: u32, ns: u64) -> bool {
        let deadline = self.kernel.interrupt_time_ns().saturating_add(ns);
        while call.hits() < target {
            if self.kernel.interrupt_time_ns() >= deadline {
                return false;
            }
            self.kernel.stall_execution(1_000);
        }
        true
    }

    /// Waits up to `ns` for `event`, polling when the IRQL forbids blocking.
    fn wait_event(&self, event: &Event, ns: u64) -> bool {
        if self.kernel.current_irql().can_block() {
            return self.kernel.wait_for_event(event, Some(ns)) == WaitStatus::Signaled;
        }
        let deadline = self.kernel.interrupt_time_ns().saturating_add(ns);
        while !event.is_set() {
            if self.kernel.interrupt_time_ns() >= deadline {
                return false;
            }
            self.kernel.stall_execution(1_000);
        }
        true
    }
}

fn single_hit(hits: u32) -> Result<(), MpError> {
    match hits {
        1 => Ok(()),
        0 => Err(MpError::CpuOffline),
        _ => {
            debug_assert!(hits <= 1, "specific call ran {hits} times");
            Err(MpError::InternalError)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn targets_filter_the_executing_cpu() {
        assert!(Targets::All.includes(CpuId(7)));
        assert!(!Targets::Others(CpuId(1)).includes(CpuId(1)));
        assert!(Targets::Others(CpuId(1)).includes(CpuId(0)));
        assert!(Targets::One(CpuId(3)).includes(CpuId(3)));
        assert!(!Targets::One(CpuId(3)).includes(CpuId(2)));
        assert!(Targets::Pair(CpuId(0), CpuId(2)).includes(CpuId(2)));
        assert!(!Targets::Pair(CpuId(0), CpuId(2)).includes(CpuId(1)));
    }

    #[test]
    fn pair_flags_reject_reserved_bits() {
        assert!(PairFlags::new().with_concurrent_exec(true).is_valid());
        assert!(!PairFlags::from_bits(0b10).is_valid());
    }
}
