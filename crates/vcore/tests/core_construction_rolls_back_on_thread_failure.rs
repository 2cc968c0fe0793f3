use std::cell::RefCell;
use std::rc::Rc;

use vcore::{CoreError, CoreId, CpuClass, CpuCore, CpuThread, MachineCpuConfig, Result};

fn machine(smp_threads: u32) -> MachineCpuConfig {
    MachineCpuConfig {
        smp_threads,
        max_cores: 1,
        ..Default::default()
    }
}

/// Factory that refuses index `fail_at` and records every index it was asked for.
fn failing_factory(
    fail_at: u32,
    calls: Rc<RefCell<Vec<u32>>>,
) -> impl FnMut(CpuClass, u32, u32) -> Result<CpuThread> {
    move |class, index, vcpu_id| {
        calls.borrow_mut().push(index);
        if index == fail_at {
            return Err(CoreError::InvalidConfig(format!(
                "attaching thread[{index}] failed"
            )));
        }
        Ok(CpuThread::new(class, index, vcpu_id))
    }
}

#[test]
fn failure_mid_sequence_leaves_no_threads() {
    for k in 1..4 {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut core = CpuCore::with_factory(
            CoreId(0),
            machine(4),
            Box::new(failing_factory(k, calls.clone())),
        );
        core.set_thread_count(4).unwrap();

        let err = core.set_cpu_model("POWER8").unwrap_err();
        assert_eq!(
            err,
            CoreError::InvalidConfig(format!("attaching thread[{k}] failed"))
        );
        assert!(
            core.threads().is_empty(),
            "construction failing at {k} must not leave {k} threads behind"
        );
        assert_eq!(*calls.borrow(), (0..=k).collect::<Vec<_>>());
    }
}

#[test]
fn failure_at_first_thread_leaves_no_threads() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut core =
        CpuCore::with_factory(CoreId(0), machine(2), Box::new(failing_factory(0, calls)));
    core.set_cpu_model("POWER8").unwrap();
    assert!(core.set_thread_count(2).is_err());
    assert!(core.threads().is_empty());
}

#[test]
fn duplicate_child_name_fails_construction() {
    // Every thread claims index 0, so the second attach collides on `thread[0]`.
    let factory = |class: CpuClass, _index: u32, vcpu_id: u32| -> Result<CpuThread> {
        Ok(CpuThread::new(class, 0, vcpu_id))
    };
    let mut core = CpuCore::with_factory(CoreId(0), machine(2), Box::new(factory));
    core.set_cpu_model("POWER8").unwrap();
    let err = core.set_thread_count(2).unwrap_err();
    assert!(err.to_string().contains("duplicate child thread[0]"), "{err}");
    assert!(core.threads().is_empty());
}

#[test]
fn construction_can_be_retried_after_failure() {
    let attempts = Rc::new(RefCell::new(0u32));
    let factory = {
        let attempts = attempts.clone();
        move |class: CpuClass, index: u32, vcpu_id: u32| -> Result<CpuThread> {
            if index == 1 && *attempts.borrow() == 0 {
                *attempts.borrow_mut() += 1;
                return Err(CoreError::InvalidConfig("transient".into()));
            }
            Ok(CpuThread::new(class, index, vcpu_id))
        }
    };
    let mut core = CpuCore::with_factory(CoreId(0), machine(2), Box::new(factory));
    core.set_thread_count(2).unwrap();
    assert!(core.set_cpu_model("POWER8").is_err());
    assert_eq!(core.cpu_model(), None);

    core.set_cpu_model("POWER8").unwrap();
    assert_eq!(core.threads().len(), 2);
}
