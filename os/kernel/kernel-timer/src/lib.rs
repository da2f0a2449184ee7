//! # Kernel timers
//!
//! Periodic and one-shot timers driven by the kernel's DPC-bound `KTIMER`
//! (or a high-resolution `EX_TIMER`), in three flavours selected by
//! [`TimerFlags`]:
//!
//! * any processor: the callback runs wherever the kernel expires the timer,
//! * one processor: the expiry DPC is targeted at it,
//! * omni: every online processor runs the callback each period. The
//!   master processor's DPC fans out to the others before running its own
//!   callback.
//!
//! Kernel timers are one-shot; each expiry re-arms the next one through
//! [`next_deadline`], which tracks the nominal schedule and falls back to
//! bounded catch-up when an expiry ran late.
//!
//! Timers are created suspended. [`Timer::start`] arms them, [`Timer::stop`]
//! suspends them again and [`Timer::destroy`] tears them down for good.
//! The callback receives the timer and a 1-based tick number (per
//! processor, for omni timers) and may restart, stop or re-interval its own
//! timer, but not destroy it.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod error;
mod flags;
mod rearm;
mod timer;

pub use config::TimerConfig;
pub use error::TimerError;
pub use flags::TimerFlags;
pub use rearm::{RearmPolicy, next_deadline};
pub use timer::{Timer, TimerCallback};
