//! # Kernel synchronization primitives
//!
//! IRQL-aware building blocks shared by the MP and timer engines:
//!
//! * [`IrqlGuard`] raises the IRQL and restores it on drop. Raising to
//!   `DISPATCH_LEVEL` pins the current thread to its processor.
//! * [`KSpinLock`] is an executive spin lock: acquiring it raises to
//!   `DISPATCH_LEVEL` first, so holders cannot be preempted and a DPC on the
//!   same processor cannot deadlock against them.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod irql;
mod spin_lock;

pub use irql::IrqlGuard;
pub use spin_lock::{KSpinLock, KSpinLockGuard};
