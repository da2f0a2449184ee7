//! Per-thread "current processor" state.

use kernel_nt::{Irql, ThreadId};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone)]
struct Context {
    cpu: u32,
    irql: Irql,
    thread: ThreadId,
}

thread_local! {
    static CONTEXT: Cell<Context> = Cell::new(Context {
        cpu: 0,
        irql: Irql::PASSIVE,
        thread: NEXT_THREAD.fetch_add(1, Ordering::Relaxed),
    });
}

pub fn cpu() -> u32 {
    CONTEXT.with(|c| c.get().cpu)
}

pub fn set_cpu(cpu: u32) {
    CONTEXT.with(|c| c.set(Context { cpu, ..c.get() }));
}

pub fn irql() -> Irql {
    CONTEXT.with(|c| c.get().irql)
}

/// Sets the level and returns the previous one.
pub fn swap_irql(irql: Irql) -> Irql {
    CONTEXT.with(|c| {
        let old = c.get();
        c.set(Context { irql, ..old });
        old.irql
    })
}

pub fn thread() -> ThreadId {
    CONTEXT.with(|c| c.get().thread)
}
