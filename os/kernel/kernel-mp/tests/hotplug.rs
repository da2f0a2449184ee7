use kernel_mp::{CpuId, Mp, MpEvent};
use kernel_nt_sim::{SimConfig, SimKernel};
use std::sync::{Arc, Mutex};

fn group_active_sum(mp: &Mp) -> u32 {
    (0..mp.max_cpu_group_count())
        .map(|g| mp.cpu_group_counts(g).unwrap().1)
        .sum()
}

#[test]
fn hot_added_cpu_comes_online_and_is_announced() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 2)]));
    let mp = Mp::init(sim.clone()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let registration = mp.notification_register(Arc::new(move |event: MpEvent, cpu: CpuId| {
        sink.lock().unwrap().push((event, cpu));
    }));

    let index = sim.add_processor(0, 2).unwrap();
    assert!(mp.is_cpu_online(CpuId(index)));
    assert_eq!(mp.online_count(), 3);
    assert_eq!(group_active_sum(&mp), 3);
    assert_eq!(*events.lock().unwrap(), [(MpEvent::Online, CpuId(index))]);

    assert!(mp.notification_deregister(&registration));
    assert!(!mp.notification_deregister(&registration));
    sim.add_processor(0, 3).unwrap();
    assert_eq!(events.lock().unwrap().len(), 1);
    assert_eq!(mp.online_count(), 4);
}

#[test]
fn placeholder_is_swapped_for_the_kernel_index() {
    // Discovery: (0,0)=0 (1,0)=1, placeholders (0,1)=4 (1,1)=3 (1,2)=2.
    let sim = SimKernel::new(SimConfig::groups(&[(2, 1), (3, 1)]));
    let mp = Mp::init(sim.clone()).unwrap();
    assert_eq!(mp.set_index_from_cpu_group_member(0, 1), Some(4));
    assert_eq!(mp.set_index_from_cpu_group_member(1, 2), Some(2));

    // The kernel numbers the first hot-added processor 2.
    assert_eq!(sim.add_processor(0, 1), Ok(2));
    assert_eq!(mp.set_index_from_cpu_group_member(0, 1), Some(2));
    assert_eq!(mp.set_index_from_cpu_group_member(1, 2), Some(4));
    assert!(mp.is_cpu_online(CpuId(2)));
    assert!(!mp.is_cpu_online(CpuId(4)));
    assert_eq!(group_active_sum(&mp), mp.online_count());

    // Work reaches the new processor.
    let ran_on = Arc::new(Mutex::new(None));
    let r = Arc::clone(&ran_on);
    mp.on_specific(CpuId(2), move |cpu| *r.lock().unwrap() = Some(cpu))
        .unwrap();
    assert_eq!(*ran_on.lock().unwrap(), Some(CpuId(2)));
}

#[test]
fn cpu_arriving_before_registration_triggers_rediscovery() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 2)]));
    sim.add_processor_before_next_registration(0, 2);
    let mp = Mp::init(sim.clone()).unwrap();

    assert_eq!(mp.online_count(), 3);
    assert!(mp.is_cpu_online(CpuId(2)));
}

#[test]
fn shutdown_stops_tracking_hot_add() {
    let sim = SimKernel::new(SimConfig::groups(&[(4, 2)]));
    let mp = Mp::init(sim.clone()).unwrap();
    mp.shutdown();
    mp.shutdown();

    sim.add_processor(0, 2).unwrap();
    assert_eq!(mp.online_count(), 2);
}
