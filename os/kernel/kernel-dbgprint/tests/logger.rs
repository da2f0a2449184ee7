use kernel_dbgprint::{DbgPrintLogger, dbg_trace};
use kernel_nt::NtKernel;
use kernel_nt_sim::{SimConfig, SimKernel};
use log::{Level, LevelFilter, Log, Record};
use std::sync::Arc;

#[test]
fn records_are_formatted_and_filtered() {
    let sim = SimKernel::new(SimConfig::flat(1));
    let logger = DbgPrintLogger::new(sim.clone(), LevelFilter::Info);

    logger.log(
        &Record::builder()
            .level(Level::Warn)
            .target("kernel_mp::dispatch")
            .args(format_args!("cpu {} slow", 3))
            .build(),
    );
    logger.log(
        &Record::builder()
            .level(Level::Debug)
            .target("kernel_mp")
            .args(format_args!("filtered"))
            .build(),
    );

    assert_eq!(sim.debug_output(), "[WARN] kernel_mp::dispatch: cpu 3 slow\n");
}

#[test]
fn trace_macro_writes_verbatim() {
    let sim = SimKernel::new(SimConfig::flat(1));
    let kernel: &dyn NtKernel = &*sim;
    dbg_trace!(kernel, "tick {}/{}\n", 1, 10);
    assert_eq!(sim.debug_output(), "tick 1/10\n");
}

#[test]
fn installed_logger_receives_facade_output() {
    let sim = SimKernel::new(SimConfig::flat(1));
    DbgPrintLogger::new(Arc::clone(&sim) as Arc<dyn NtKernel>, LevelFilter::Trace)
        .init()
        .unwrap();
    assert!(DbgPrintLogger::new(sim.clone(), LevelFilter::Trace).init().is_err());

    log::info!(target: "kernel_timer", "armed");
    assert!(sim.debug_output().contains("[INFO] kernel_timer: armed\n"));
}
