//! One thread that expires `KTIMER`s and high-resolution timers.

use crate::dpc_queue::DpcQueues;
use kernel_nt::{Dpc, KernelTimer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// What an expired timer does: queue its DPC.
///
/// High-resolution timers wrap their callback in a DPC of their own, so
/// both kinds expire the same way.
struct TimerObject {
    dpc: Arc<Dpc>,
    /// Bumped by every set and cancel; stale heap entries are skipped.
    generation: AtomicU64,
    armed: AtomicBool,
    high_resolution: bool,
    /// Processor the DPC goes to when it has no explicit target.
    default_cpu: u32,
}

struct Armed {
    deadline: Instant,
    generation: u64,
    timer: Weak<TimerObject>,
}

struct ServiceState {
    armed: Vec<Armed>,
    shutdown: bool,
}

pub struct TimerService {
    state: Mutex<ServiceState>,
    changed: Condvar,
}

impl TimerService {
    pub fn start(queues: Arc<DpcQueues>, resolve: impl Fn(&Dpc) -> u32 + Send + 'static) -> Arc<Self> {
        let service = Arc::new(Self {
            state: Mutex::new(ServiceState {
                armed: Vec::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&service);
        thread::Builder::new()
            .name("sim-timers".into())
            .spawn(move || worker.run(&queues, &resolve))
            .unwrap_or_else(|e| panic!("spawning timer service: {e}"));
        service
    }

    pub fn create(self: &Arc<Self>, dpc: Arc<Dpc>, high_resolution: bool, default_cpu: u32) -> Box<dyn KernelTimer> {
        Box::new(SimTimer {
            service: Arc::clone(self),
            object: Arc::new(TimerObject {
                dpc,
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
                high_resolution,
                default_cpu,
            }),
        })
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, queues: &DpcQueues, resolve: &dyn Fn(&Dpc) -> u32) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let next = state
                .armed
                .iter()
                .enumerate()
                .min_by_key(|(_, a)| a.deadline)
                .map(|(i, a)| (i, a.deadline));
            match next {
                Some((i, deadline)) if deadline <= now => {
                    let entry = state.armed.swap_remove(i);
                    drop(state);
                    if let Some(timer) = entry.timer.upgrade() {
                        let current = timer.generation.load(Ordering::Acquire) == entry.generation;
                        if current && timer.armed.swap(false, Ordering::AcqRel) {
                            let cpu = if timer.dpc.target().is_some() {
                                resolve(&timer.dpc)
                            } else {
                                timer.default_cpu
                            };
                            queues.insert(cpu, &timer.dpc);
                        }
                    }
                    state = self.lock();
                }
                Some((_, deadline)) => {
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

struct SimTimer {
    service: Arc<TimerService>,
    object: Arc<TimerObject>,
}

impl KernelTimer for SimTimer {
    fn set_relative(&self, due_ns: u64) -> bool {
        let mut state = self.service.lock();
        let generation = self.object.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let was_armed = self.object.armed.swap(true, Ordering::AcqRel);
        state.armed.push(Armed {
            deadline: Instant::now() + Duration::from_nanos(due_ns),
            generation,
            timer: Arc::downgrade(&self.object),
        });
        drop(state);
        self.service.changed.notify_all();
        was_armed
    }

    fn cancel(&self) -> bool {
        let _state = self.service.lock();
        self.object.generation.fetch_add(1, Ordering::AcqRel);
        self.object.armed.swap(false, Ordering::AcqRel)
    }

    fn is_high_resolution(&self) -> bool {
        self.object.high_resolution
    }
}

impl Drop for SimTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
