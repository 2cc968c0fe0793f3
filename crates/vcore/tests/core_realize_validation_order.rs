use vcore::{
    CoreError, CoreId, CpuCore, MachineCpuConfig, RunQueue, SlotRegistry, ThreadState,
    TopologyRegistry, VcpuScheduler,
};

fn machine() -> MachineCpuConfig {
    MachineCpuConfig {
        smp_threads: 2,
        max_cores: 2,
        ..Default::default()
    }
}

fn invalid(msg: &str) -> CoreError {
    CoreError::InvalidConfig(msg.to_string())
}

#[test]
fn checks_run_in_order_and_first_failure_wins() {
    let mut reg = SlotRegistry::with_core_slots(2);
    let mut rq = RunQueue::new();

    let mut core = CpuCore::new(CoreId(0), machine());
    assert_eq!(
        core.realize(&mut reg, &mut rq),
        Err(invalid("nr_threads property can't be 0"))
    );

    core.set_thread_count(2).unwrap();
    assert_eq!(
        core.realize(&mut reg, &mut rq),
        Err(invalid("cpu_model property isn't set"))
    );

    core.set_cpu_model("POWER8").unwrap();
    assert_eq!(
        core.realize(&mut reg, &mut rq),
        Err(invalid("slot property isn't set"))
    );

    core.set_slot("core[0]").unwrap();
    core.realize(&mut reg, &mut rq).unwrap();
    assert!(core.is_realized());
}

#[test]
fn missing_slot_has_no_side_effects() {
    let mut reg = SlotRegistry::with_core_slots(2);
    let mut rq = RunQueue::new();

    let mut core = CpuCore::new(CoreId(1), machine());
    core.set_thread_count(2).unwrap();
    core.set_cpu_model("POWER8").unwrap();
    assert!(core.realize(&mut reg, &mut rq).is_err());

    assert_eq!(reg.occupied(), 0);
    assert!(rq.is_empty());
    assert!(!core.is_realized());
    assert!(core
        .threads()
        .iter()
        .all(|t| t.state() == ThreadState::Constructed));
}

#[test]
fn realize_links_slot_and_schedules_threads_in_order() {
    let mut reg = SlotRegistry::with_core_slots(2);
    let mut rq = RunQueue::new();

    let mut core = CpuCore::new(CoreId(1), machine());
    core.set_slot("core[1]").unwrap();
    core.set_cpu_model("POWER8").unwrap();
    core.set_thread_count(2).unwrap();
    core.realize(&mut reg, &mut rq).unwrap();

    assert_eq!(reg.link("core[1]"), Some(CoreId(1)));
    assert_eq!(rq.vcpus().collect::<Vec<_>>(), vec![2, 3]);
    assert!(core.threads().iter().all(|t| t.is_realized()));

    // Properties are frozen once realized.
    assert!(core.set_slot("core[0]").is_err());
    assert!(core.realize(&mut reg, &mut rq).is_err());
}

#[test]
fn occupied_slot_fails_with_topology_conflict() {
    let mut reg = SlotRegistry::with_core_slots(1);
    let mut rq = RunQueue::new();
    reg.set_link("core[0]", Some(CoreId(9))).unwrap();

    let mut core = CpuCore::new(CoreId(0), machine());
    core.set_slot("core[0]").unwrap();
    core.set_thread_count(2).unwrap();
    core.set_cpu_model("POWER8").unwrap();

    let err = core.realize(&mut reg, &mut rq).unwrap_err();
    assert!(matches!(err, CoreError::TopologyConflict(_)), "{err}");
    assert_eq!(reg.link("core[0]"), Some(CoreId(9)));
    assert!(rq.is_empty());
}

#[test]
fn child_failure_stops_sequence_without_rolling_back_siblings() {
    let mut reg = SlotRegistry::with_core_slots(1);
    let mut rq = RunQueue::new();
    let cfg = MachineCpuConfig {
        smp_threads: 4,
        max_cores: 1,
        ..Default::default()
    };
    rq.reject_vcpu(2);

    let mut core = CpuCore::new(CoreId(0), cfg);
    core.set_slot("core[0]").unwrap();
    core.set_thread_count(4).unwrap();
    core.set_cpu_model("POWER8").unwrap();

    assert!(core.realize(&mut reg, &mut rq).is_err());

    // Threads 0 and 1 made it in; thread 2 realized but could not be scheduled; thread 3 was
    // never reached.
    assert!(rq.is_scheduled(0));
    assert!(rq.is_scheduled(1));
    assert!(!rq.is_scheduled(2));
    assert_eq!(core.threads()[3].state(), ThreadState::Constructed);
    assert_eq!(reg.link("core[0]"), Some(CoreId(0)));
}
