use crate::dbg_trace;
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_nt::NtKernel;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct DbgPrintLogger {
    kernel: Arc<dyn NtKernel>,
    max_level: LevelFilter,
}

impl DbgPrintLogger {
    #[must_use]
    pub fn new(kernel: Arc<dyn NtKernel>, max_level: LevelFilter) -> Self {
        Self { kernel, max_level }
    }

    /// Installs the logger for the lifetime of the driver. Call once.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        // The facade wants a `&'static dyn Log`; a logger lives until unload.
        log::set_logger(Box::leak(Box::new(self)))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for DbgPrintLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        dbg_trace!(
            &*self.kernel,
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
