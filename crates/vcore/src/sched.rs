use std::collections::BTreeSet;

use crate::error::{CoreError, Result};

/// The machine's active scheduling set.
pub trait VcpuScheduler {
    /// Makes a realized vCPU schedulable.
    fn add_vcpu(&mut self, vcpu_id: u32) -> Result<()>;

    /// Halts a vCPU's execution context without removing it from the set.
    fn stop_vcpu(&mut self, vcpu_id: u32);

    /// Removes a vCPU from the set. Removing an absent id is a no-op.
    fn remove_vcpu(&mut self, vcpu_id: u32);

    fn is_scheduled(&self, vcpu_id: u32) -> bool;
}

/// Ordered in-memory scheduling set.
#[derive(Debug, Default, Clone)]
pub struct RunQueue {
    active: BTreeSet<u32>,
    stopped: BTreeSet<u32>,
    rejected: BTreeSet<u32>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes [`VcpuScheduler::add_vcpu`] fail for `vcpu_id`.
    pub fn reject_vcpu(&mut self, vcpu_id: u32) {
        self.rejected.insert(vcpu_id);
    }

    /// Scheduled vCPU ids in ascending order (running and stopped).
    pub fn vcpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.active.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_stopped(&self, vcpu_id: u32) -> bool {
        self.stopped.contains(&vcpu_id)
    }
}

impl VcpuScheduler for RunQueue {
    fn add_vcpu(&mut self, vcpu_id: u32) -> Result<()> {
        if self.rejected.contains(&vcpu_id) {
            return Err(CoreError::InvalidConfig(format!(
                "vcpu {vcpu_id} cannot be initialized"
            )));
        }
        if !self.active.insert(vcpu_id) {
            return Err(CoreError::TopologyConflict(format!(
                "vcpu {vcpu_id} is already scheduled"
            )));
        }
        Ok(())
    }

    fn stop_vcpu(&mut self, vcpu_id: u32) {
        if self.active.contains(&vcpu_id) {
            self.stopped.insert(vcpu_id);
        }
    }

    fn remove_vcpu(&mut self, vcpu_id: u32) {
        self.active.remove(&vcpu_id);
        self.stopped.remove(&vcpu_id);
    }

    fn is_scheduled(&self, vcpu_id: u32) -> bool {
        self.active.contains(&vcpu_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_add_is_a_conflict() {
        let mut rq = RunQueue::new();
        rq.add_vcpu(3).unwrap();
        assert!(matches!(rq.add_vcpu(3), Err(CoreError::TopologyConflict(_))));
        assert_eq!(rq.len(), 1);
    }

    #[test]
    fn remove_clears_stopped_flag_and_is_idempotent() {
        let mut rq = RunQueue::new();
        rq.add_vcpu(1).unwrap();
        rq.stop_vcpu(1);
        assert!(rq.is_stopped(1));
        rq.remove_vcpu(1);
        rq.remove_vcpu(1);
        assert!(!rq.is_scheduled(1));
        assert!(!rq.is_stopped(1));
    }
}
