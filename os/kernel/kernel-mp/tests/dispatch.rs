use kernel_mp::{CpuId, DispatchStrategy, Mp, MpConfig, MpError, PairFlags, PokeStrategy, SpecificWait};
use kernel_nt::{EntryPoints, Irql, NtKernel};
use kernel_nt_sim::{SimConfig, SimKernel};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};

/// Targeted DPCs only, but with processor groups so topology is the same.
fn dpc_only() -> EntryPoints {
    EntryPoints::legacy()
        .with_processor_groups(true)
        .with_processor_change_callback(true)
}

fn recorder() -> (Arc<Mutex<Vec<CpuId>>>, impl Fn(CpuId) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |cpu: CpuId| sink.lock().unwrap().push(cpu))
}

fn sorted(seen: &Mutex<Vec<CpuId>>) -> Vec<u32> {
    let mut v: Vec<u32> = seen.lock().unwrap().iter().map(|c| c.index()).collect();
    v.sort_unstable();
    v
}

#[test]
fn on_all_counts_every_online_cpu_once() {
    for entry_points in [EntryPoints::modern(), dpc_only()] {
        let sim = SimKernel::new(SimConfig::groups(&[(4, 3), (2, 2)]).with_entry_points(entry_points));
        let mp = Mp::init(sim).unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        mp.on_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), mp.online_count(), "{entry_points:?}");

        let (seen, worker) = recorder();
        mp.on_all(worker).unwrap();
        assert_eq!(sorted(&seen), [0, 1, 2, 3, 4]);
    }
}

#[test]
fn strategies_follow_the_entry_points() {
    let mp = Mp::init(SimKernel::new(SimConfig::flat(2))).unwrap();
    assert_eq!(mp.dispatch_strategy(), DispatchStrategy::BroadcastIpi);
    assert_eq!(mp.poke_strategy(), PokeStrategy::HalIpiW7Plus);
    assert!(mp.on_pair_is_concurrent_exec_supported());
    assert!(mp.on_all_is_concurrent_safe());

    let mp = Mp::init(SimKernel::new(SimConfig::flat(2).with_entry_points(dpc_only()))).unwrap();
    assert_eq!(mp.dispatch_strategy(), DispatchStrategy::TargetedDpc);
    assert_eq!(mp.poke_strategy(), PokeStrategy::Unsupported);
    assert!(!mp.on_pair_is_concurrent_exec_supported());
}

#[test]
fn dpc_workers_run_at_dispatch_level() {
    let sim = SimKernel::new(SimConfig::flat(3).with_entry_points(dpc_only()));
    let mp = Mp::init(sim.clone()).unwrap();
    let levels = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&levels);
    let k = sim.clone();
    mp.on_all(move |_| l.lock().unwrap().push(k.current_irql())).unwrap();
    assert_eq!(*levels.lock().unwrap(), [Irql::DISPATCH; 3]);
    assert_eq!(sim.current_irql(), Irql::PASSIVE);
}

#[test]
fn on_others_skips_the_caller() {
    for entry_points in [EntryPoints::modern(), dpc_only()] {
        let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(entry_points));
        let mp = Mp::init(sim.clone()).unwrap();
        sim.bind_current_thread(1);

        let (seen, worker) = recorder();
        mp.on_others(worker).unwrap();
        assert_eq!(sorted(&seen), [0, 2, 3], "{entry_points:?}");
    }
}

#[test]
fn on_specific_on_the_calling_cpu_queues_nothing() {
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(dpc_only()));
    let mp = Mp::init(sim.clone()).unwrap();
    sim.bind_current_thread(2);

    let before = sim.dpc_insert_count();
    let (seen, worker) = recorder();
    mp.on_specific(CpuId(2), worker).unwrap();
    assert_eq!(sim.dpc_insert_count(), before);
    assert_eq!(sorted(&seen), [2]);
}

#[test]
fn on_specific_reaches_another_cpu() {
    for entry_points in [EntryPoints::modern(), dpc_only()] {
        let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(entry_points));
        let mp = Mp::init(sim).unwrap();

        let (seen, worker) = recorder();
        mp.on_specific(CpuId(3), worker).unwrap();
        assert_eq!(sorted(&seen), [3], "{entry_points:?}");
    }
}

#[test]
fn on_specific_rejects_unknown_and_offline_cpus() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 2)]));
    let mp = Mp::init(sim).unwrap();

    assert_eq!(mp.on_specific(CpuId(4), |_| {}), Err(MpError::CpuNotFound));
    assert_eq!(mp.on_specific(CpuId(3), |_| {}), Err(MpError::CpuOffline));
    assert_eq!(mp.poke_cpu(CpuId(9)), Err(MpError::CpuNotFound));
    assert_eq!(mp.poke_cpu(CpuId(2)), Err(MpError::CpuOffline));
}

#[test]
fn on_specific_withdraws_a_dpc_the_target_never_runs() {
    let sim = SimKernel::new(SimConfig::flat(2).with_entry_points(dpc_only()));
    let config = MpConfig {
        specific_wait: SpecificWait {
            spin_iterations: 16,
            short_wait_ns: 1_000_000,
            poke_wait_ns: 2_000_000,
            give_up_interval_ns: 1_000_000_000,
        },
        ..MpConfig::new()
    };
    let mp = Mp::with_config(sim.clone(), config).unwrap();
    sim.park_processor(1);

    let (seen, worker) = recorder();
    assert_eq!(mp.on_specific(CpuId(1), worker), Err(MpError::Timeout));

    sim.unpark_processor(1);
    sim.flush_queued_dpcs();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn concurrent_pair_runs_both_at_once() {
    let sim = SimKernel::new(SimConfig::flat(4));
    let mp = Mp::init(sim).unwrap();

    // Would never get past the barrier unless both run simultaneously.
    let rendezvous = Arc::new(Barrier::new(2));
    let (seen, record) = recorder();
    let r = Arc::clone(&rendezvous);
    let flags = PairFlags::new().with_concurrent_exec(true);
    mp.on_pair(CpuId(1), CpuId(3), flags, move |cpu| {
        r.wait();
        record(cpu);
    })
    .unwrap();
    assert_eq!(sorted(&seen), [1, 3]);
}

#[test]
fn pair_over_dpcs_runs_on_both() {
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(dpc_only()));
    let mp = Mp::init(sim.clone()).unwrap();

    let (seen, worker) = recorder();
    mp.on_pair(CpuId(0), CpuId(2), PairFlags::new(), worker).unwrap();
    assert_eq!(sorted(&seen), [0, 2]);

    let flags = PairFlags::new().with_concurrent_exec(true);
    assert_eq!(
        mp.on_pair(CpuId(0), CpuId(2), flags, |_| {}),
        Err(MpError::NotSupported)
    );
}

#[test]
fn pair_argument_checks() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 3)]));
    let mp = Mp::init(sim).unwrap();
    let none = PairFlags::new();

    assert_eq!(mp.on_pair(CpuId(1), CpuId(1), none, |_| {}), Err(MpError::InvalidParameter));
    assert_eq!(
        mp.on_pair(CpuId(0), CpuId(1), PairFlags::from_bits(0x8000_0000), |_| {}),
        Err(MpError::InvalidParameter)
    );
    assert_eq!(mp.on_pair(CpuId(0), CpuId(7), none, |_| {}), Err(MpError::CpuNotFound));
    assert_eq!(mp.on_pair(CpuId(0), CpuId(3), none, |_| {}), Err(MpError::CpuOffline));
}

#[test]
fn pair_with_an_unresponsive_cpu_never_succeeds() {
    let sim = SimKernel::new(SimConfig::flat(4));
    let mp = Mp::init(sim.clone()).unwrap();
    sim.park_processor(3);

    let (seen, worker) = recorder();
    let flags = PairFlags::new().with_concurrent_exec(true);
    let result = mp.on_pair(CpuId(1), CpuId(3), flags, worker);
    assert!(
        matches!(result, Err(MpError::NotAllCpusResponded | MpError::CpuOffline)),
        "{result:?}"
    );
    assert_eq!(sorted(&seen), [1]);
    sim.unpark_processor(3);
}

#[test]
fn poke_uses_the_cheapest_available_mechanism() {
    let sim = SimKernel::new(SimConfig::flat(4));
    let mp = Mp::init(sim.clone()).unwrap();
    mp.poke_cpu(CpuId(2)).unwrap();
    assert_eq!(sim.poke_count(2), 1);
    assert_eq!(sim.poke_count(1), 0);

    let pre_w7 = EntryPoints::legacy().with_hal_request_ipi_pre_w7(true);
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(pre_w7));
    let mp = Mp::init(sim.clone()).unwrap();
    assert_eq!(mp.poke_strategy(), PokeStrategy::HalIpiPreW7);
    mp.poke_cpu(CpuId(3)).unwrap();
    assert_eq!(sim.poke_count(3), 1);

    let sim = SimKernel::new(SimConfig::flat(2).with_entry_points(dpc_only()));
    let mp = Mp::init(sim).unwrap();
    assert_eq!(mp.poke_cpu(CpuId(1)), Err(MpError::NotSupported));
}

#[test]
fn high_importance_dpc_poke_queues_a_dpc() {
    let sim = SimKernel::new(SimConfig::flat(2).with_entry_points(dpc_only().with_high_importance_dpc_ipi(true)));
    let mp = Mp::init(sim.clone()).unwrap();
    assert_eq!(mp.poke_strategy(), PokeStrategy::HighImportanceDpc);

    let before = sim.dpc_insert_count();
    mp.poke_cpu(CpuId(1)).unwrap();
    assert_eq!(sim.dpc_insert_count(), before + 1);
}

#[test]
fn repeated_dpc_poke_leaves_a_queued_dpc_alone() {
    let sim = SimKernel::new(SimConfig::flat(3).with_entry_points(dpc_only().with_high_importance_dpc_ipi(true)));
    let mp = Mp::init(sim.clone()).unwrap();
    sim.park_processor(1);

    let before = sim.dpc_insert_count();
    mp.poke_cpu(CpuId(1)).unwrap();
    mp.poke_cpu(CpuId(1)).unwrap();
    assert_eq!(sim.dpc_insert_count(), before + 1);

    sim.unpark_processor(1);
    sim.flush_queued_dpcs();
    mp.poke_cpu(CpuId(1)).unwrap();
    mp.poke_cpu(CpuId(2)).unwrap();
    assert_eq!(sim.dpc_insert_count(), before + 3);
}

#[test]
fn concurrent_on_all_calls_do_not_interfere() {
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(dpc_only()));
    let mp = Mp::init(sim).unwrap();
    let hits = Arc::new(AtomicU32::new(0));

    std::thread::scope(|s| {
        for _ in 0..4 {
            let (mp, hits) = (&mp, &hits);
            s.spawn(move || {
                for _ in 0..25 {
                    let h = Arc::clone(hits);
                    mp.on_all(move |_| {
                        h.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            });
        }
    });
    assert_eq!(hits.load(Ordering::SeqCst), 4 * 25 * 4);
}

#[test]
fn visited_cpus_are_unique() {
    let sim = SimKernel::new(SimConfig::groups(&[(3, 3), (3, 3)]));
    let mp = Mp::init(sim).unwrap();
    let (seen, worker) = recorder();
    mp.on_all(worker).unwrap();
    let unique: BTreeSet<_> = seen.lock().unwrap().iter().copied().collect();
    assert_eq!(unique.len(), seen.lock().unwrap().len());
    assert_eq!(unique.len(), 6);
}

fn quick_wait() -> MpConfig {
    MpConfig {
        specific_wait: SpecificWait {
            spin_iterations: 16,
            short_wait_ns: 1_000_000,
            poke_wait_ns: 2_000_000,
            give_up_interval_ns: 1_000_000_000,
        },
        ..MpConfig::new()
    }
}

#[test]
fn pair_at_dispatch_level_gives_up_on_a_parked_cpu() {
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(dpc_only()));
    let mp = Mp::with_config(sim.clone(), quick_wait()).unwrap();
    sim.park_processor(3);

    let (seen, worker) = recorder();
    let old = sim.raise_irql(Irql::DISPATCH);
    let result = mp.on_pair(CpuId(1), CpuId(3), PairFlags::new(), worker);
    sim.lower_irql(old);
    assert_eq!(result, Err(MpError::NotAllCpusResponded));

    // The withdrawn DPC must not run once the processor comes back.
    sim.unpark_processor(3);
    sim.flush_queued_dpcs();
    assert_eq!(sorted(&seen), [1]);
}

#[test]
fn on_all_reports_a_parked_cpu_at_any_irql() {
    let sim = SimKernel::new(SimConfig::flat(3).with_entry_points(dpc_only()));
    let mp = Mp::with_config(sim.clone(), quick_wait()).unwrap();
    sim.park_processor(2);

    for irql in [Irql::PASSIVE, Irql::DISPATCH] {
        let (seen, worker) = recorder();
        let old = sim.raise_irql(irql);
        let result = mp.on_all(worker);
        sim.lower_irql(old);
        assert_eq!(result, Err(MpError::NotAllCpusResponded), "{irql:?}");
        assert_eq!(sorted(&seen), [0, 1], "{irql:?}");
    }

    sim.unpark_processor(2);
    sim.flush_queued_dpcs();
}
