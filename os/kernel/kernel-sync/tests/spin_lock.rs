use kernel_nt::{Irql, NtKernel};
use kernel_nt_sim::{SimConfig, SimKernel};
use kernel_sync::{IrqlGuard, KSpinLock};
use std::sync::Arc;
use std::{panic, thread};

fn kernel() -> Arc<dyn NtKernel> {
    SimKernel::new(SimConfig::flat(2))
}

#[test]
fn lock_raises_to_dispatch_and_restores() {
    let k = kernel();
    let l = KSpinLock::new(Arc::clone(&k), 0_u32);

    assert_eq!(k.current_irql(), Irql::PASSIVE);
    {
        let mut g = l.lock();
        assert_eq!(k.current_irql(), Irql::DISPATCH);
        *g = 41;
    }
    assert_eq!(k.current_irql(), Irql::PASSIVE);

    // lock again; previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn nested_under_irql_guard_leaves_irql_alone() {
    let k = kernel();
    let l = KSpinLock::new(Arc::clone(&k), ());

    let pin = IrqlGuard::raise(&*k, Irql::DISPATCH);
    {
        let _g = l.lock_at_dpc_level();
        assert_eq!(k.current_irql(), Irql::DISPATCH);
    }
    {
        let _g = l.lock();
    }
    // the guard above must not have lowered below the pin
    assert_eq!(k.current_irql(), Irql::DISPATCH);
    drop(pin);
    assert_eq!(k.current_irql(), Irql::PASSIVE);
}

#[test]
fn irql_guard_does_not_lower_when_already_higher() {
    let k = kernel();
    let outer = IrqlGuard::raise(&*k, Irql::CLOCK);
    {
        let _inner = IrqlGuard::raise(&*k, Irql::DISPATCH);
        assert_eq!(k.current_irql(), Irql::CLOCK);
    }
    assert_eq!(k.current_irql(), Irql::CLOCK);
    drop(outer);
    assert_eq!(k.current_irql(), Irql::PASSIVE);
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = KSpinLock::new(kernel(), String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = l.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(KSpinLock::new(kernel(), 0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn lock_and_irql_are_released_on_panic() {
    let k = kernel();
    let l = KSpinLock::new(Arc::clone(&k), 0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(k.current_irql(), Irql::PASSIVE);
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = KSpinLock::new(kernel(), 0u8);
    takes_sync(&l);
}
