//! # Kernel debugger output
//!
//! Routes the `log` facade and ad-hoc traces to the kernel's debug-print
//! entry point ([`NtKernel::dbg_print`](kernel_nt::NtKernel::dbg_print)),
//! which ends up in an attached kernel debugger or a `DebugView`-style
//! capture tool.
//!
//! ## Output path
//!
//! ```text
//! log::info!(..) / dbg_trace!(kernel, ..)
//!     ↓
//! DbgPrintSink (fmt::Write)
//!     ↓
//! NtKernel::dbg_print(&str)   one call per formatted piece
//! ```
//!
//! Formatting happens piecewise through `core::fmt::Write`, so logging
//! never allocates and is usable at any IRQL the debug-print routine
//! accepts.
//!
//! ## Features
//!
//! * `enabled` (default): output is compiled in. Without it every write is a
//!   no-op and the logger only filters.
//!
//! ## Usage
//!
//! ```rust,no_run
//! # fn demo(kernel: std::sync::Arc<dyn kernel_nt::NtKernel>) {
//! use kernel_dbgprint::DbgPrintLogger;
//! use log::{LevelFilter, info};
//!
//! DbgPrintLogger::new(kernel, LevelFilter::Debug)
//!     .init()
//!     .expect("logger initialization");
//! info!("MP runtime up");
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod logger;

pub use logger::DbgPrintLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod dbg_fmt {
    use core::fmt::{self, Write};
    use kernel_nt::NtKernel;

    pub struct DbgPrintSink<'k>(pub &'k dyn NtKernel);

    impl Write for DbgPrintSink<'_> {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            if !s.is_empty() {
                self.0.dbg_print(s);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn dbg_write(kernel: &dyn NtKernel, args: fmt::Arguments) {
        // Best effort; nothing to report a failure to.
        let _ = fmt::write(&mut DbgPrintSink(kernel), args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod dbg_fmt {
    use core::fmt;
    use kernel_nt::NtKernel;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn dbg_write(_: &dyn NtKernel, _: fmt::Arguments) {}
}

/// `DbgPrint` with `format!` syntax, bypassing the log facade.
#[macro_export]
macro_rules! dbg_trace {
    ($kernel:expr, $($arg:tt)*) => {{
        $crate::dbg_fmt::dbg_write($kernel, core::format_args!($($arg)*));
    }};
}
