use crate::{RearmPolicy, TimerConfig, TimerError, TimerFlags, next_deadline};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use kernel_mp::{CpuId, Mp};
use kernel_nt::{Dpc, KernelError, KernelTimer, NIL_THREAD, NS_PER_NT_TICK, NtKernel};
use kernel_sync::KSpinLock;
use log::{debug, trace};

const TIMER_MAGIC: u32 = 0x1957_1004;
const TIMER_MAGIC_DEAD: u32 = !TIMER_MAGIC;

/// Called with the timer and the 1-based tick number.
pub type TimerCallback = Box<dyn Fn(&Timer, u64) + Send + Sync>;

/// Handle to a kernel timer. Clones refer to the same timer.
///
/// Dropping the last handle cancels the timer; [`Timer::destroy`] does the
/// same explicitly and also waits for running expiry routines.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

/// Schedule of a running timer, guarded by the timer spin lock.
struct Timing {
    start_ns: u64,
    /// Master tick number due at `start_ns`.
    base_tick: u64,
    /// Interrupt time the kernel timer is armed for.
    due_ns: u64,
}

/// Per-processor part of a timer.
struct SubTimer {
    cpu: CpuId,
    tick: AtomicU64,
    dpc: Arc<Dpc>,
    /// The DPC could not be targeted at creation; retried before use.
    needs_targeting: AtomicBool,
    /// Thread inside the callback on this processor, or [`NIL_THREAD`].
    active_thread: AtomicU64,
}

struct TimerInner {
    magic: AtomicU32,
    mp: Arc<Mp>,
    kernel: Arc<dyn NtKernel>,
    callback: TimerCallback,
    policy: RearmPolicy,
    omni: bool,
    target: Option<CpuId>,
    /// Sub-timer driven by the kernel timer.
    master: usize,
    suspended: AtomicBool,
    /// Nanoseconds, 0 for one-shot. Written under `timing`.
    interval_ns: AtomicU64,
    timing: KSpinLock<Timing>,
    master_tick: AtomicU64,
    /// Omni one-shot: processors yet to finish their callback.
    omni_countdown: AtomicU32,
    /// One per set index for omni timers, else one.
    sub_timers: Vec<SubTimer>,
    kernel_timer: Box<dyn KernelTimer>,
}

impl Timer {
    /// [`Timer::with_config`] with the default configuration.
    ///
    /// # Errors
    /// See [`Timer::with_config`].
    pub fn create<F>(mp: &Arc<Mp>, interval_ns: u64, flags: TimerFlags, callback: F) -> Result<Self, TimerError>
    where
        F: Fn(&Self, u64) + Send + Sync + 'static,
    {
        Self::with_config(mp, interval_ns, flags, TimerConfig::new(), callback)
    }

    /// Creates a suspended timer. `interval_ns == 0` makes it one-shot.
    ///
    /// Omni timers get one sub-timer per possible processor; their master
    /// is the first online processor.
    ///
    /// # Errors
    /// * [`TimerError::InvalidFlags`] for reserved bits.
    /// * [`TimerError::CpuNotFound`] if the requested processor is not possible.
    /// * [`TimerError::NotSupported`] for `high_res` without kernel support.
    /// * [`TimerError::NoMemory`] if the sub-timers or the kernel timer
    ///   could not be allocated.
    pub fn with_config<F>(
        mp: &Arc<Mp>,
        interval_ns: u64,
        flags: TimerFlags,
        config: TimerConfig,
        callback: F,
    ) -> Result<Self, TimerError>
    where
        F: Fn(&Self, u64) + Send + Sync + 'static,
    {
        if !flags.is_valid() {
            return Err(TimerError::InvalidFlags);
        }
        let kernel = Arc::clone(mp.kernel());
        let omni = flags.is_omni();
        let target = flags.target();
        if target.is_some_and(|cpu| !mp.is_cpu_possible(cpu)) {
            return Err(TimerError::CpuNotFound);
        }
        if flags.high_res() && !Self::can_do_high_resolution(&*kernel) {
            return Err(TimerError::NotSupported);
        }

        let (count, master) = if omni {
            let master = mp.online_set().first().ok_or(TimerError::CpuOffline)?;
            (mp.possible_count() as usize, master.index() as usize)
        } else {
            (1, 0)
        };
        let mut sub_timers = Vec::new();
        sub_timers
            .try_reserve_exact(count)
            .map_err(|_| TimerError::NoMemory)?;

        let mut high_res_failure = None;
        let inner = Arc::new_cyclic(|weak: &Weak<TimerInner>| {
            for i in 0..count {
                #[allow(clippy::cast_possible_truncation)]
                let cpu = if omni { Some(CpuId(i as u32)) } else { target };
                let weak = Weak::clone(weak);
                let dpc = if i == master {
                    Dpc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.expire_master();
                        }
                    })
                } else {
                    Dpc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.expire_slave(i);
                        }
                    })
                };
                let dpc = Arc::new(dpc);
                let needs_targeting = cpu.is_some_and(|cpu| !bind_dpc(mp, &*kernel, &dpc, cpu));
                sub_timers.push(SubTimer {
                    cpu: cpu.unwrap_or(CpuId::NIL),
                    tick: AtomicU64::new(0),
                    dpc,
                    needs_targeting: AtomicBool::new(needs_targeting),
                    active_thread: AtomicU64::new(NIL_THREAD),
                });
            }

            let master_dpc = Arc::clone(&sub_timers[master].dpc);
            let kernel_timer = if flags.high_res() {
                let weak = Weak::clone(weak);
                let cpu_bound = omni || target.is_some();
                let expired = Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.high_res_expired(cpu_bound);
                    }
                });
                kernel.allocate_high_resolution_timer(expired).unwrap_or_else(|e| {
                    // Placeholder, never armed.
                    high_res_failure = Some(e);
                    kernel.create_timer(Arc::clone(&master_dpc))
                })
            } else {
                kernel.create_timer(master_dpc)
            };

            TimerInner {
                magic: AtomicU32::new(TIMER_MAGIC),
                mp: Arc::clone(mp),
                kernel: Arc::clone(&kernel),
                callback: Box::new(callback),
                policy: config.rearm,
                omni,
                target,
                master,
                suspended: AtomicBool::new(true),
                interval_ns: AtomicU64::new(interval_ns),
                timing: KSpinLock::new(
                    Arc::clone(&kernel),
                    Timing {
                        start_ns: 0,
                        base_tick: 1,
                        due_ns: 0,
                    },
                ),
                master_tick: AtomicU64::new(0),
                omni_countdown: AtomicU32::new(0),
                sub_timers,
                kernel_timer,
            }
        });

        if let Some(e) = high_res_failure {
            return Err(match e {
                KernelError::InsufficientResources => TimerError::NoMemory,
                KernelError::NotSupported => TimerError::NotSupported,
                e => e.into(),
            });
        }
        debug!(
            "timer created: interval {interval_ns} ns, {}{}",
            match (omni, target) {
                (true, _) => "all CPUs",
                (false, Some(_)) => "one CPU",
                (false, None) => "any CPU",
            },
            if flags.high_res() { ", high resolution" } else { "" }
        );
        Ok(Self { inner })
    }

    /// Arms a suspended timer; the first tick is due `first_ns` from now.
    ///
    /// # Errors
    /// * [`TimerError::InvalidHandle`] after [`destroy`](Self::destroy).
    /// * [`TimerError::Active`] if it is running.
    /// * [`TimerError::CpuOffline`] if its processor is offline or cannot be targeted.
    pub fn start(&self, first_ns: u64) -> Result<(), TimerError> {
        let inner = &*self.inner;
        inner.check_alive()?;
        if let Some(cpu) = inner.target {
            if !inner.mp.is_cpu_online(cpu) || !inner.ensure_targeted(&inner.sub_timers[0]) {
                return Err(TimerError::CpuOffline);
            }
        }
        if inner.omni && !inner.ensure_targeted(&inner.sub_timers[inner.master]) {
            return Err(TimerError::CpuOffline);
        }

        let mut timing = inner.timing.lock();
        if !inner.suspended.load(Ordering::Acquire) {
            return Err(TimerError::Active);
        }
        inner.master_tick.store(0, Ordering::Relaxed);
        for sub in &inner.sub_timers {
            sub.tick.store(0, Ordering::Relaxed);
        }
        inner.omni_countdown.store(0, Ordering::Relaxed);

        let start_ns = inner.kernel.interrupt_time_ns().saturating_add(first_ns);
        *timing = Timing {
            start_ns,
            base_tick: 1,
            due_ns: start_ns,
        };
        inner.suspended.store(false, Ordering::Release);
        inner.kernel_timer.set_relative(first_ns);
        Ok(())
    }

    /// Suspends a running timer and withdraws queued expiries. Callbacks
    /// already executing are not waited for.
    ///
    /// # Errors
    /// [`TimerError::InvalidHandle`] after [`destroy`](Self::destroy),
    /// [`TimerError::Suspended`] if it was not running.
    pub fn stop(&self) -> Result<(), TimerError> {
        let inner = &*self.inner;
        inner.check_alive()?;
        let _timing = inner.timing.lock();
        if inner.suspended.swap(true, Ordering::AcqRel) {
            return Err(TimerError::Suspended);
        }
        inner.disarm();
        Ok(())
    }

    /// Changes the period.
    ///
    /// A suspended timer just takes the new value. A running one keeps its
    /// next tick if that is due within one new interval and continues from
    /// there at the new rate; otherwise it is re-armed one new interval
    /// from now.
    ///
    /// # Errors
    /// * [`TimerError::InvalidParameter`] for 0.
    /// * [`TimerError::NotSupported`] for a running one-shot timer.
    /// * [`TimerError::InvalidHandle`] after [`destroy`](Self::destroy).
    pub fn change_interval(&self, interval_ns: u64) -> Result<(), TimerError> {
        let inner = &*self.inner;
        inner.check_alive()?;
        if interval_ns == 0 {
            return Err(TimerError::InvalidParameter);
        }

        let mut timing = inner.timing.lock();
        if inner.suspended.load(Ordering::Acquire) {
            inner.interval_ns.store(interval_ns, Ordering::Release);
            return Ok(());
        }
        if inner.interval_ns.load(Ordering::Acquire) == 0 {
            return Err(TimerError::NotSupported);
        }

        let now = inner.kernel.interrupt_time_ns();
        let next_tick = inner.master_tick.load(Ordering::Acquire) + 1;
        if timing.due_ns <= now.saturating_add(interval_ns) {
            // Keep the pending expiry as the new origin.
            timing.start_ns = timing.due_ns;
            timing.base_tick = next_tick;
        } else {
            let due_ns = now.saturating_add(interval_ns);
            *timing = Timing {
                start_ns: due_ns,
                base_tick: next_tick,
                due_ns,
            };
            inner.kernel_timer.set_relative(interval_ns);
        }
        inner.interval_ns.store(interval_ns, Ordering::Release);
        Ok(())
    }

    /// Stops the timer for good and waits for expiry routines to finish.
    ///
    /// # Errors
    /// [`TimerError::InvalidContext`] from the timer's own callback,
    /// [`TimerError::InvalidHandle`] if it was destroyed already.
    pub fn destroy(&self) -> Result<(), TimerError> {
        let inner = &*self.inner;
        let me = inner.kernel.current_thread();
        if inner
            .sub_timers
            .iter()
            .any(|sub| sub.active_thread.load(Ordering::Acquire) == me)
        {
            return Err(TimerError::InvalidContext);
        }
        inner
            .magic
            .compare_exchange(TIMER_MAGIC, TIMER_MAGIC_DEAD, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TimerError::InvalidHandle)?;

        {
            let _timing = inner.timing.lock();
            inner.suspended.store(true, Ordering::Release);
            inner.disarm();
        }
        if inner.kernel.current_irql().can_block() {
            inner.kernel.flush_queued_dpcs();
        }
        debug!("timer destroyed after {} ticks", inner.master_tick.load(Ordering::Relaxed));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Ticks of the master since the last start.
    #[must_use]
    pub fn master_tick(&self) -> u64 {
        self.inner.master_tick.load(Ordering::Acquire)
    }

    /// Callbacks run on `cpu` since the last start: any processor of an
    /// omni timer, or the target of a single-processor one.
    #[must_use]
    pub fn cpu_tick(&self, cpu: CpuId) -> Option<u64> {
        let inner = &*self.inner;
        let sub = if inner.omni {
            inner.sub_timers.get(cpu.index() as usize)?
        } else {
            inner.sub_timers.first().filter(|sub| sub.cpu == cpu)?
        };
        Some(sub.tick.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_omni(&self) -> bool {
        self.inner.omni
    }

    /// Processor of the master sub-timer, `None` for any-processor timers.
    #[must_use]
    pub fn master_cpu(&self) -> Option<CpuId> {
        let inner = &*self.inner;
        let cpu = inner.sub_timers.get(inner.master)?.cpu;
        (cpu != CpuId::NIL).then_some(cpu)
    }

    #[must_use]
    pub fn interval_ns(&self) -> u64 {
        self.inner.interval_ns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_high_resolution(&self) -> bool {
        self.inner.kernel_timer.is_high_resolution()
    }

    // ------------------------------------------------------------------
    // System timer resolution
    // ------------------------------------------------------------------

    /// Whether [`TimerFlags::high_res`] can be honored.
    #[must_use]
    pub fn can_do_high_resolution(kernel: &dyn NtKernel) -> bool {
        kernel.entry_points().high_resolution_timers()
    }

    /// The system clock tick (`KeQueryTimeIncrement`), in nanoseconds.
    #[must_use]
    pub fn system_granularity(kernel: &dyn NtKernel) -> u64 {
        kernel.time_increment_ns()
    }

    /// Asks for a finer system clock. Returns the granularity now in
    /// effect, which may be coarser than requested.
    ///
    /// # Errors
    /// [`TimerError::InvalidParameter`] below one NT time unit.
    pub fn request_system_granularity(kernel: &dyn NtKernel, ns: u64) -> Result<u64, TimerError> {
        if ns < NS_PER_NT_TICK {
            return Err(TimerError::InvalidParameter);
        }
        Ok(kernel.set_timer_resolution(ns, true))
    }

    /// Withdraws a [`request_system_granularity`](Self::request_system_granularity).
    ///
    /// # Errors
    /// [`TimerError::InvalidParameter`] below one NT time unit.
    pub fn release_system_granularity(kernel: &dyn NtKernel, ns: u64) -> Result<(), TimerError> {
        if ns < NS_PER_NT_TICK {
            return Err(TimerError::InvalidParameter);
        }
        kernel.set_timer_resolution(0, false);
        Ok(())
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("interval_ns", &self.interval_ns())
            .field("suspended", &self.is_suspended())
            .field("omni", &self.is_omni())
            .field("master_tick", &self.master_tick())
            .finish_non_exhaustive()
    }
}

fn bind_dpc(mp: &Mp, kernel: &dyn NtKernel, dpc: &Dpc, cpu: CpuId) -> bool {
    mp.processor_number_from_id(cpu)
        .is_some_and(|number| kernel.set_target_processor_dpc(dpc, number).is_ok())
}

impl TimerInner {
    fn check_alive(&self) -> Result<(), TimerError> {
        if self.magic.load(Ordering::Acquire) == TIMER_MAGIC {
            Ok(())
        } else {
            Err(TimerError::InvalidHandle)
        }
    }

    fn ensure_targeted(&self, sub: &SubTimer) -> bool {
        if !sub.needs_targeting.load(Ordering::Acquire) {
            return true;
        }
        let bound = bind_dpc(&self.mp, &*self.kernel, &sub.dpc, sub.cpu);
        if bound {
            sub.needs_targeting.store(false, Ordering::Release);
        }
        bound
    }

    /// Cancels the kernel timer and withdraws queued DPCs.
    fn disarm(&self) {
        self.kernel_timer.cancel();
        for sub in &self.sub_timers {
            self.kernel.remove_queue_dpc(&sub.dpc);
        }
    }

    fn high_res_expired(self: &Arc<Self>, cpu_bound: bool) {
        if cpu_bound {
            self.kernel.insert_queue_dpc(&self.sub_timers[self.master].dpc);
        } else {
            self.expire_master();
        }
    }

    fn expire_master(self: &Arc<Self>) {
        if self.check_alive().is_err() {
            return;
        }
        {
            let mut timing = self.timing.lock_at_dpc_level();
            if self.suspended.load(Ordering::Acquire) {
                return;
            }
            let tick = self.master_tick.fetch_add(1, Ordering::AcqRel) + 1;
            let interval_ns = self.interval_ns.load(Ordering::Acquire);
            if interval_ns != 0 {
                self.rearm(&mut timing, tick, interval_ns);
            } else if !self.omni {
                // Suspended first so the callback can restart it.
                self.suspended.store(true, Ordering::Release);
            }
        }

        if self.omni {
            self.fan_out();
        }
        self.run_callback(self.master);
    }

    fn expire_slave(self: &Arc<Self>, index: usize) {
        if self.check_alive().is_err() || self.suspended.load(Ordering::Acquire) {
            return;
        }
        self.run_callback(index);
    }

    fn rearm(&self, timing: &mut Timing, tick: u64, interval_ns: u64) {
        let now = self.kernel.interrupt_time_ns();
        let next = (tick + 1).saturating_sub(timing.base_tick);
        let due_ns = next_deadline(now, timing.start_ns, interval_ns, next, &self.policy);
        let nominal = timing.start_ns.saturating_add(next.saturating_mul(interval_ns));
        if due_ns != nominal {
            trace!(
                "tick {tick} ran {} ns late, next expiry in {} ns",
                now.saturating_sub(nominal.saturating_sub(interval_ns)),
                due_ns - now
            );
        }
        timing.due_ns = due_ns;
        self.kernel_timer.set_relative(due_ns - now);
    }

    /// Queues the slave DPC of every other online processor.
    fn fan_out(&self) {
        let online = self.mp.online_set();
        let slaves = || {
            online
                .iter()
                .filter_map(|cpu| self.sub_timers.get(cpu.index() as usize))
                .filter(|sub| sub.cpu.index() as usize != self.master)
        };

        let mut participants = 1;
        for sub in slaves() {
            if self.ensure_targeted(sub) {
                participants += 1;
            }
        }
        if self.interval_ns.load(Ordering::Acquire) == 0 {
            self.omni_countdown.store(participants, Ordering::Release);
        }
        for sub in slaves().filter(|sub| !sub.needs_targeting.load(Ordering::Acquire)) {
            self.kernel.insert_queue_dpc(&sub.dpc);
        }
    }

    fn run_callback(self: &Arc<Self>, index: usize) {
        let sub = &self.sub_timers[index];
        let tick = sub.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let timer = Timer {
            inner: Arc::clone(self),
        };

        sub.active_thread
            .store(self.kernel.current_thread(), Ordering::Release);
        (self.callback)(&timer, tick);
        sub.active_thread.store(NIL_THREAD, Ordering::Release);

        if self.omni
            && self.interval_ns.load(Ordering::Acquire) == 0
            && self.omni_countdown.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.suspended.store(true, Ordering::Release);
        }
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        self.disarm();
    }
}
