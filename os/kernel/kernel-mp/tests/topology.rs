use kernel_mp::{CpuId, Mp, MpConfig, MpError};
use kernel_nt::{EntryPoints, NtKernel, ProcessorNumber};
use kernel_nt_sim::{SimConfig, SimKernel};

#[test]
fn set_index_and_id_round_trip_for_online_cpus() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 3), (4, 2)]));
    let mp = Mp::init(sim.clone()).unwrap();

    assert_eq!(mp.possible_count(), 8);
    assert_eq!(mp.max_cpu_id(), CpuId(7));
    assert_eq!(mp.online_count(), 5);
    for cpu in mp.online_set().iter() {
        let index = mp.set_index_from_cpu_id(cpu).unwrap();
        assert_eq!(mp.cpu_id_from_set_index(index), Some(cpu));
    }
    assert_eq!(mp.cpu_id_from_set_index(8), None);
    assert_eq!(mp.set_index_from_cpu_id(CpuId(8)), None);
}

#[test]
fn group_active_counts_add_up_to_online_count() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 3), (2, 1), (3, 0)]));
    let mp = Mp::init(sim).unwrap();

    assert_eq!(mp.max_cpu_group_count(), 3);
    let active: u32 = (0..3).map(|g| mp.cpu_group_counts(g).unwrap().1).sum();
    assert_eq!(active, mp.online_count());
    assert_eq!(mp.cpu_group_counts(2), Some((3, 0)));
    assert_eq!(mp.cpu_group_counts(3), None);
}

#[test]
fn online_cpus_use_the_kernel_index() {
    let sim = SimKernel::new(SimConfig::groups(&[(2, 2), (2, 1)]));
    let mp = Mp::init(sim.clone()).unwrap();

    for cpu in mp.online_set().iter() {
        let number = mp.processor_number_from_id(cpu).unwrap();
        assert_eq!(sim.processor_index_from_number(number), Some(cpu.index()));
        assert_eq!(
            mp.set_index_from_cpu_group_member(number.group(), u32::from(number.number())),
            Some(cpu.index())
        );
    }
}

#[test]
fn every_member_has_an_index_and_offline_ones_are_possible() {
    let sim = SimKernel::new(SimConfig::groups(&[(2, 1), (3, 1)]));
    let mp = Mp::init(sim).unwrap();

    let mut seen: Vec<u32> = [(0, 0), (0, 1), (1, 0), (1, 1), (1, 2)]
        .into_iter()
        .map(|(g, m)| mp.set_index_from_cpu_group_member(g, m).unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, [0, 1, 2, 3, 4]);

    let offline = CpuId(mp.set_index_from_cpu_group_member(0, 1).unwrap());
    assert!(mp.is_cpu_possible(offline));
    assert!(!mp.is_cpu_online(offline));
    assert_eq!(mp.possible_set().count(), 5);
    assert_eq!(mp.set_index_from_cpu_group_member(0, 2), None);
}

#[test]
fn legacy_kernel_is_a_single_group() {
    let sim = SimKernel::new(SimConfig::flat(4).with_entry_points(EntryPoints::legacy()));
    let mp = Mp::init(sim).unwrap();

    assert_eq!(mp.max_cpu_group_count(), 1);
    assert_eq!(mp.online_count(), 4);
    assert_eq!(mp.processor_number_from_id(CpuId(3)), Some(ProcessorNumber::of(0, 3)));
}

#[test]
fn processor_count_above_the_cap_is_fatal() {
    let sim = SimKernel::new(SimConfig::flat(4));
    let config = MpConfig {
        max_cpus: 2,
        ..MpConfig::new()
    };
    assert_eq!(Mp::with_config(sim, config).err(), Some(MpError::TooManyCpus(4)));
}

#[test]
fn current_cpu_follows_the_calling_thread() {
    let sim = SimKernel::new(SimConfig::flat(3));
    let mp = Mp::init(sim.clone()).unwrap();

    assert_eq!(mp.cpu_id(), CpuId(0));
    sim.bind_current_thread(2);
    assert_eq!(mp.cpu_id(), CpuId(2));
    assert_eq!(mp.cpu_set_index(), 2);
    assert!(!mp.is_cpu_work_pending());
}

#[test]
fn discovery_retries_when_a_cpu_arrives_mid_read() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 2), (2, 1)]));
    sim.add_processors_during_discovery(&[(0, 2)]);
    let mp = Mp::init(sim.clone()).unwrap();

    assert_eq!(mp.online_count(), 4);
    assert_eq!(mp.online_count(), sim.active_processor_count());
    let active: u32 = (0..2).map(|g| mp.cpu_group_counts(g).unwrap().1).sum();
    assert_eq!(active, 4);
    let index = sim.processor_index_from_number(ProcessorNumber::of(0, 2)).unwrap();
    assert!(mp.is_cpu_online(CpuId(index)));
}

#[test]
fn discovery_gives_up_when_the_count_never_settles() {
    let sim = SimKernel::new(SimConfig::groups(&[(8, 1)]));
    sim.add_processors_during_discovery(&[(0, 1), (0, 2), (0, 3)]);
    let config = MpConfig {
        discovery_attempts: 3,
        ..MpConfig::new()
    };
    assert!(matches!(Mp::with_config(sim, config), Err(MpError::TopologyUnstable)));
}
