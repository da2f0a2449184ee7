//! Per-processor DPC queues, each drained by a worker thread.

use crate::context;
use kernel_nt::{Dpc, DpcImportance, Irql};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<Dpc>>,
    running: bool,
    parked: bool,
}

#[derive(Default)]
struct CpuQueue {
    state: Mutex<QueueState>,
    /// Signalled on insert, unpark and shutdown (worker side) and whenever
    /// the queue drains (flush side).
    changed: Condvar,
}

impl CpuQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DpcQueues {
    cpus: Vec<CpuQueue>,
    shutdown: AtomicBool,
    inserts: AtomicU64,
}

impl DpcQueues {
    /// Creates the queues and spawns one detached worker per processor index.
    pub fn start(count: u32) -> Arc<Self> {
        let queues = Arc::new(Self {
            cpus: (0..count).map(|_| CpuQueue::default()).collect(),
            shutdown: AtomicBool::new(false),
            inserts: AtomicU64::new(0),
        });
        for index in 0..count {
            let queues = Arc::clone(&queues);
            thread::Builder::new()
                .name(format!("sim-cpu{index}"))
                .spawn(move || queues.worker(index))
                .unwrap_or_else(|e| panic!("spawning DPC worker {index}: {e}"));
        }
        queues
    }

    pub fn insert(&self, index: u32, dpc: &Arc<Dpc>) -> bool {
        let Some(cpu) = self.cpus.get(index as usize) else {
            return false;
        };
        if !dpc.mark_inserted() {
            return false;
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let mut state = cpu.lock();
        if dpc.importance() == DpcImportance::High {
            state.pending.push_front(Arc::clone(dpc));
        } else {
            state.pending.push_back(Arc::clone(dpc));
        }
        drop(state);
        cpu.changed.notify_all();
        true
    }

    pub fn remove(&self, dpc: &Dpc) -> bool {
        for cpu in &self.cpus {
            let mut state = cpu.lock();
            if let Some(pos) = state.pending.iter().position(|d| std::ptr::eq(Arc::as_ptr(d), dpc)) {
                state.pending.remove(pos);
                drop(state);
                dpc.mark_removed();
                cpu.changed.notify_all();
                return true;
            }
        }
        false
    }

    /// Waits until every responsive processor has nothing queued or running.
    pub fn flush(&self) {
        for cpu in &self.cpus {
            let mut state = cpu.lock();
            while !state.parked && (state.running || !state.pending.is_empty()) {
                state = cpu
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    pub fn set_parked(&self, index: u32, parked: bool) {
        if let Some(cpu) = self.cpus.get(index as usize) {
            cpu.lock().parked = parked;
            cpu.changed.notify_all();
        }
    }

    pub fn is_parked(&self, index: u32) -> bool {
        self.cpus
            .get(index as usize)
            .is_some_and(|cpu| cpu.lock().parked)
    }

    pub fn insert_count(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for cpu in &self.cpus {
            // Take the lock so a worker between its check and its wait
            // cannot miss the wakeup.
            drop(cpu.lock());
            cpu.changed.notify_all();
        }
    }

    fn worker(&self, index: u32) {
        context::set_cpu(index);
        context::swap_irql(Irql::DISPATCH);
        let cpu = &self.cpus[index as usize];
        loop {
            let mut state = cpu.lock();
            let dpc = loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if !state.parked {
                    if let Some(dpc) = state.pending.pop_front() {
                        break dpc;
                    }
                }
                state = cpu
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            };
            state.running = true;
            drop(state);

            dpc.mark_removed();
            dpc.invoke();
            drop(dpc);

            cpu.lock().running = false;
            cpu.changed.notify_all();
        }
    }
}
