use alloc::sync::Arc;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use kernel_nt::{Irql, NtKernel};

/// Executive spin lock (`KSPIN_LOCK`) protecting a value.
///
/// [`lock`](Self::lock) raises to `DISPATCH_LEVEL` before spinning
/// (`KeAcquireSpinLock`), [`lock_at_dpc_level`](Self::lock_at_dpc_level)
/// expects the caller to be there already (`KeAcquireSpinLockAtDpcLevel`).
/// The guard restores the previous IRQL after releasing the lock.
pub struct KSpinLock<T> {
    kernel: Arc<dyn NtKernel>,
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for KSpinLock<T> {}
unsafe impl<T: Send> Send for KSpinLock<T> {}

impl<T> KSpinLock<T> {
    pub fn new(kernel: Arc<dyn NtKernel>, inner: T) -> Self {
        Self {
            kernel,
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Raise to `DISPATCH_LEVEL`, then spin until acquired.
    #[inline]
    pub fn lock(&self) -> KSpinLockGuard<'_, T> {
        let current = self.kernel.current_irql();
        let old = if current < Irql::DISPATCH {
            Some(self.kernel.raise_irql(Irql::DISPATCH))
        } else {
            None
        };
        self.acquire();
        KSpinLockGuard { lock: self, old }
    }

    /// Acquire from code already running at `DISPATCH_LEVEL` or above.
    #[inline]
    pub fn lock_at_dpc_level(&self) -> KSpinLockGuard<'_, T> {
        debug_assert!(self.kernel.current_irql() >= Irql::DISPATCH);
        self.acquire();
        KSpinLockGuard {
            lock: self,
            old: None,
        }
    }

    /// Closure convenience, built on the raising guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Test-and-test-and-set.
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }
}

pub struct KSpinLockGuard<'a, T> {
    lock: &'a KSpinLock<T>,
    /// IRQL to return to once released.
    old: Option<Irql>,
}

impl<T> Deref for KSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for KSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for KSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section, then drop the IRQL.
        self.lock.locked.store(false, Ordering::Release);
        if let Some(old) = self.old {
            self.lock.kernel.lower_irql(old);
        }
    }
}
