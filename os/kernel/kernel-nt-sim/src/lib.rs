//! # Simulated NT kernel
//!
//! A host implementation of [`NtKernel`] for tests. Every present processor
//! is a worker thread draining its own DPC queue at `DISPATCH_LEVEL`; the
//! "current processor" and IRQL of any other thread live in thread-local
//! state and default to processor index 0 at `PASSIVE_LEVEL`.
//!
//! Beyond the kernel surface the simulator can hot-add processors
//! ([`SimKernel::add_processor`]), park them so they stop answering IPIs and
//! DPCs ([`SimKernel::park_processor`]) and report what happened (DPC
//! insertions, HAL IPIs, debug output).
//!
//! ```
//! use kernel_nt::{EntryPoints, NtKernel};
//! use kernel_nt_sim::{SimConfig, SimKernel};
//!
//! let kernel = SimKernel::new(SimConfig::groups(&[(4, 2), (2, 2)]).with_entry_points(EntryPoints::modern()));
//! assert_eq!(kernel.maximum_processor_count(), 6);
//! assert_eq!(kernel.active_processor_count(), 4);
//! ```

mod context;
mod dpc_queue;
mod timer_service;
mod topology;

use dpc_queue::DpcQueues;
use kernel_nt::{
    AffinityEx, ChangeRegistration, Dpc, EntryPoints, Event, GroupRelationship, Irql, KernelError,
    KernelTimer, NtKernel, ProcessorChangeCallback, ProcessorChangeContext, ProcessorChangeState,
    ProcessorNumber, ThreadId, WaitStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use timer_service::TimerService;
use topology::SimTopology;

/// Shape of the simulated machine.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// `(maximum members, initially active members)` per group.
    pub layout: Vec<(u8, u8)>,
    pub entry_points: EntryPoints,
    /// What `KeQueryTimeIncrement` reports.
    pub time_increment_ns: u64,
    /// Finest resolution `ExSetTimerResolution` grants.
    pub min_timer_resolution_ns: u64,
}

impl SimConfig {
    /// One group with `cpus` active processors.
    #[must_use]
    pub fn flat(cpus: u8) -> Self {
        Self::groups(&[(cpus, cpus)])
    }

    #[must_use]
    pub fn groups(layout: &[(u8, u8)]) -> Self {
        Self {
            layout: layout.to_vec(),
            entry_points: EntryPoints::modern(),
            time_increment_ns: 15_625_000,
            min_timer_resolution_ns: 500_000,
        }
    }

    #[must_use]
    pub fn with_entry_points(mut self, entry_points: EntryPoints) -> Self {
        self.entry_points = entry_points;
        self
    }
}

struct Registration {
    id: u64,
    callback: Arc<dyn ProcessorChangeCallback>,
}

pub struct SimKernel {
    config: SimConfig,
    epoch: Instant,
    topology: Arc<Mutex<SimTopology>>,
    queues: Arc<DpcQueues>,
    timers: Arc<TimerService>,
    callbacks: Mutex<Vec<Registration>>,
    next_registration: AtomicU64,
    /// Serializes hot-add notifications.
    change_lock: Mutex<()>,
    /// Hot-add performed right before the next callback registration.
    racing_add: Mutex<Option<(u16, u8)>>,
    /// Hot-adds performed one per `group_relationship` query.
    discovery_adds: Mutex<VecDeque<(u16, u8)>>,
    pokes: Vec<AtomicU64>,
    timer_resolution_ns: AtomicU64,
    debug_output: Mutex<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimKernel {
    #[must_use]
    pub fn new(config: SimConfig) -> Arc<Self> {
        let topology = Arc::new(Mutex::new(SimTopology::new(&config.layout)));
        let total = lock(&topology).total();
        let queues = DpcQueues::start(total);
        let resolve_topology = Arc::clone(&topology);
        let timers = TimerService::start(Arc::clone(&queues), move |dpc: &Dpc| {
            dpc.target()
                .and_then(|n| lock(&resolve_topology).index_of(n))
                .unwrap_or(0)
        });
        Arc::new(Self {
            epoch: Instant::now(),
            topology,
            queues,
            timers,
            callbacks: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            change_lock: Mutex::new(()),
            racing_add: Mutex::new(None),
            discovery_adds: Mutex::new(VecDeque::new()),
            pokes: (0..total).map(|_| AtomicU64::new(0)).collect(),
            timer_resolution_ns: AtomicU64::new(config.time_increment_ns),
            debug_output: Mutex::new(String::new()),
            config,
        })
    }

    /// Makes the calling thread run "on" processor `index`.
    pub fn bind_current_thread(&self, index: u32) {
        context::set_cpu(index);
    }

    /// Hot-adds `(group, member)`: assigns the next processor index, runs
    /// the `StartAdd` phase and then `AddCompleted`, or `AddFailed` when a
    /// callback vetoed the processor.
    ///
    /// # Errors
    /// [`KernelError::InvalidParameter`] for members outside the layout or
    /// already active, [`KernelError::Unsuccessful`] when a callback failed
    /// the `StartAdd` phase.
    pub fn add_processor(&self, group: u16, member: u8) -> Result<u32, KernelError> {
        let _serial = lock(&self.change_lock);
        let (index, number) = self.bring_online(group, member)?;

        let callbacks: Vec<_> = lock(&self.callbacks).iter().map(|r| Arc::clone(&r.callback)).collect();
        let mut ctx = ProcessorChangeContext {
            state: ProcessorChangeState::StartAdd,
            index,
            number,
        };
        let vetoed = callbacks.iter().any(|cb| cb.on_processor_change(&ctx).is_err());
        if vetoed {
            self.take_offline(group, member);
            ctx.state = ProcessorChangeState::AddFailed;
            for cb in &callbacks {
                let _ = cb.on_processor_change(&ctx);
            }
            return Err(KernelError::Unsuccessful);
        }

        ctx.state = ProcessorChangeState::AddCompleted;
        for cb in &callbacks {
            let _ = cb.on_processor_change(&ctx);
        }
        Ok(index)
    }

    /// The next callback registration first hot-adds `(group, member)`
    /// without notifying anyone, modelling a processor that arrives between
    /// topology discovery and registration.
    pub fn add_processor_before_next_registration(&self, group: u16, member: u8) {
        *lock(&self.racing_add) = Some((group, member));
    }

    /// Each of the next `group_relationship` queries hot-adds one of
    /// `members` without notifying anyone, after taking its snapshot. Models
    /// processors arriving while the topology is being read.
    pub fn add_processors_during_discovery(&self, members: &[(u16, u8)]) {
        lock(&self.discovery_adds).extend(members.iter().copied());
    }

    /// The processor keeps its place in the topology but stops running DPCs
    /// and is skipped by `KeIpiGenericCall`.
    pub fn park_processor(&self, index: u32) {
        self.queues.set_parked(index, true);
    }

    pub fn unpark_processor(&self, index: u32) {
        self.queues.set_parked(index, false);
    }

    /// Number of successful `KeInsertQueueDpc` calls so far, timers included.
    #[must_use]
    pub fn dpc_insert_count(&self) -> u64 {
        self.queues.insert_count()
    }

    /// HAL IPIs sent to processor `index`.
    #[must_use]
    pub fn poke_count(&self, index: u32) -> u64 {
        self.pokes.get(index as usize).map_or(0, |p| p.load(Ordering::Relaxed))
    }

    /// Everything passed to `dbg_print` so far.
    #[must_use]
    pub fn debug_output(&self) -> String {
        lock(&self.debug_output).clone()
    }

    fn bring_online(&self, group: u16, member: u8) -> Result<(u32, ProcessorNumber), KernelError> {
        let mut topo = lock(&self.topology);
        let g = topo.groups.get(usize::from(group)).ok_or(KernelError::InvalidParameter)?;
        if member >= g.maximum || g.active_mask & (1 << member) != 0 {
            return Err(KernelError::InvalidParameter);
        }
        let index = topo.assign(group, member).ok_or(KernelError::InvalidParameter)?;
        topo.groups[usize::from(group)].active_mask |= 1 << member;
        Ok((index, ProcessorNumber::of(group, member)))
    }

    fn take_offline(&self, group: u16, member: u8) {
        let mut topo = lock(&self.topology);
        topo.groups[usize::from(group)].active_mask &= !(1 << member);
        topo.unassign(group, member);
    }

    fn responsive_cpus(&self) -> Vec<u32> {
        lock(&self.topology)
            .active_indices()
            .into_iter()
            .filter(|&i| !self.queues.is_parked(i))
            .collect()
    }

    fn poke(&self, index: u32) {
        if let Some(p) = self.pokes.get(index as usize) {
            p.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for SimKernel {
    fn drop(&mut self) {
        self.timers.shutdown();
        self.queues.shutdown();
    }
}

impl NtKernel for SimKernel {
    fn entry_points(&self) -> EntryPoints {
        self.config.entry_points
    }

    fn maximum_group_count(&self) -> u16 {
        if self.config.entry_points.processor_groups() {
            #[allow(clippy::cast_possible_truncation)]
            let n = self.config.layout.len() as u16;
            n
        } else {
            1
        }
    }

    fn maximum_processor_count(&self) -> u32 {
        let topo = lock(&self.topology);
        if self.config.entry_points.processor_groups() {
            topo.total()
        } else {
            topo.groups.first().map_or(0, |g| u32::from(g.maximum))
        }
    }

    fn active_processor_count(&self) -> u32 {
        let topo = lock(&self.topology);
        if self.config.entry_points.processor_groups() {
            topo.active_count()
        } else {
            topo.groups.first().map_or(0, |g| g.active_mask.count_ones())
        }
    }

    fn active_processors(&self) -> u64 {
        lock(&self.topology).groups.first().map_or(0, |g| g.active_mask)
    }

    fn group_relationship(&self) -> Result<GroupRelationship, KernelError> {
        if !self.config.entry_points.processor_groups() {
            return Err(KernelError::NotSupported);
        }
        let relationship = lock(&self.topology).relationship();
        let arriving = lock(&self.discovery_adds).pop_front();
        if let Some((group, member)) = arriving {
            self.bring_online(group, member)?;
        }
        Ok(relationship)
    }

    fn processor_index_from_number(&self, number: ProcessorNumber) -> Option<u32> {
        lock(&self.topology).index_of(number)
    }

    fn processor_number_from_index(&self, index: u32) -> Option<ProcessorNumber> {
        lock(&self.topology).numbers.get(index as usize).copied().flatten()
    }

    fn current_processor_number(&self) -> ProcessorNumber {
        self.processor_number_from_index(context::cpu())
            .unwrap_or_else(|| ProcessorNumber::of(0, 0))
    }

    fn current_processor_index(&self) -> u32 {
        context::cpu()
    }

    fn current_thread(&self) -> ThreadId {
        context::thread()
    }

    fn current_irql(&self) -> Irql {
        context::irql()
    }

    fn raise_irql(&self, new_irql: Irql) -> Irql {
        let old = context::swap_irql(new_irql);
        debug_assert!(old <= new_irql, "KeRaiseIrql to a lower level");
        old
    }

    fn lower_irql(&self, old_irql: Irql) {
        let current = context::swap_irql(old_irql);
        debug_assert!(old_irql <= current, "KeLowerIrql to a higher level");
    }

    fn set_target_processor_dpc(&self, dpc: &Dpc, number: ProcessorNumber) -> Result<(), KernelError> {
        if dpc.is_inserted() || lock(&self.topology).index_of(number).is_none() {
            return Err(KernelError::InvalidParameter);
        }
        dpc.bind_target(number);
        Ok(())
    }

    fn insert_queue_dpc(&self, dpc: &Arc<Dpc>) -> bool {
        let index = match dpc.target() {
            Some(n) => match lock(&self.topology).index_of(n) {
                Some(i) => i,
                None => return false,
            },
            None => context::cpu(),
        };
        self.queues.insert(index, dpc)
    }

    fn remove_queue_dpc(&self, dpc: &Dpc) -> bool {
        self.queues.remove(dpc)
    }

    fn flush_queued_dpcs(&self) {
        self.queues.flush();
    }

    fn ipi_generic_call(&self, f: &(dyn Fn() + Sync)) -> Result<(), KernelError> {
        if !self.config.entry_points.ipi_generic_call() {
            return Err(KernelError::NotSupported);
        }
        let cpus = self.responsive_cpus();
        let rendezvous = Barrier::new(cpus.len());
        std::thread::scope(|s| {
            for &index in &cpus {
                let rendezvous = &rendezvous;
                s.spawn(move || {
                    context::set_cpu(index);
                    context::swap_irql(Irql::IPI);
                    rendezvous.wait();
                    f();
                });
            }
        });
        Ok(())
    }

    fn hal_request_ipi_w7_plus(&self, targets: &AffinityEx) -> Result<(), KernelError> {
        if !self.config.entry_points.hal_request_ipi_w7_plus() {
            return Err(KernelError::NotSupported);
        }
        targets.iter().for_each(|i| self.poke(i));
        Ok(())
    }

    fn hal_request_ipi_pre_w7(&self, targets: u64) -> Result<(), KernelError> {
        if !self.config.entry_points.hal_request_ipi_pre_w7() {
            return Err(KernelError::NotSupported);
        }
        (0..64).filter(|b| targets & (1 << b) != 0).for_each(|i| self.poke(i));
        Ok(())
    }

    fn wait_for_event(&self, event: &Event, timeout_ns: Option<u64>) -> WaitStatus {
        let deadline = timeout_ns.map(|ns| Instant::now() + Duration::from_nanos(ns));
        loop {
            if event.is_set() {
                return WaitStatus::Signaled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WaitStatus::Timeout;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn interrupt_time_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn stall_execution(&self, ns: u64) {
        let until = Instant::now() + Duration::from_nanos(ns);
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn time_increment_ns(&self) -> u64 {
        self.config.time_increment_ns
    }

    fn set_timer_resolution(&self, ns: u64, set: bool) -> u64 {
        let granted = if set {
            ns.clamp(self.config.min_timer_resolution_ns, self.config.time_increment_ns)
        } else {
            self.config.time_increment_ns
        };
        self.timer_resolution_ns.store(granted, Ordering::Relaxed);
        granted
    }

    fn create_timer(&self, dpc: Arc<Dpc>) -> Box<dyn KernelTimer> {
        self.timers.create(dpc, false, context::cpu())
    }

    fn allocate_high_resolution_timer(
        &self,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Box<dyn KernelTimer>, KernelError> {
        if !self.config.entry_points.high_resolution_timers() {
            return Err(KernelError::NotSupported);
        }
        let dpc = Arc::new(Dpc::new(move || callback()));
        Ok(self.timers.create(dpc, true, 0))
    }

    fn register_processor_change_callback(
        &self,
        callback: Arc<dyn ProcessorChangeCallback>,
    ) -> Result<ChangeRegistration, KernelError> {
        if !self.config.entry_points.processor_change_callback() {
            return Err(KernelError::NotSupported);
        }
        let _serial = lock(&self.change_lock);
        if let Some((group, member)) = lock(&self.racing_add).take() {
            self.bring_online(group, member)?;
        }
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks).push(Registration { id, callback });
        Ok(ChangeRegistration(id))
    }

    fn deregister_processor_change_callback(&self, registration: ChangeRegistration) {
        lock(&self.callbacks).retain(|r| r.id != registration.0);
    }

    fn dbg_print(&self, text: &str) {
        lock(&self.debug_output).push_str(text);
    }
}
