use crate::error::{CoreError, Result};
use crate::model::CpuClass;

/// Lifecycle of a [`CpuThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Constructed,
    Realized,
    /// Execution context stopped ahead of removal; no longer schedulable.
    Stopped,
    Destroyed,
}

/// One virtual CPU unit within a core.
///
/// Only identity and lifecycle are modelled here; register state and instruction emulation live
/// elsewhere.
#[derive(Debug)]
pub struct CpuThread {
    index: u32,
    vcpu_id: u32,
    class: CpuClass,
    name: String,
    state: ThreadState,
}

impl CpuThread {
    /// Instantiates an uninitialized thread of `class`.
    pub fn new(class: CpuClass, index: u32, vcpu_id: u32) -> Self {
        Self {
            index,
            vcpu_id,
            class,
            name: child_name(index),
            state: ThreadState::Uninitialized,
        }
    }

    /// Architectural thread index within the owning core.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Machine-wide virtual CPU id.
    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn class(&self) -> CpuClass {
        self.class
    }

    /// Child name under the owning core (`thread[i]`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_realized(&self) -> bool {
        self.state == ThreadState::Realized
    }

    pub(crate) fn construct(&mut self) -> Result<()> {
        self.transition(ThreadState::Uninitialized, ThreadState::Constructed)
    }

    pub(crate) fn realize(&mut self) -> Result<()> {
        self.transition(ThreadState::Constructed, ThreadState::Realized)
    }

    /// Stops the execution context. Constructed-but-unrealized threads have nothing to stop.
    pub(crate) fn stop(&mut self) {
        if self.state == ThreadState::Realized {
            self.state = ThreadState::Stopped;
        }
    }

    pub(crate) fn destroy(&mut self) {
        self.state = ThreadState::Destroyed;
    }

    fn transition(&mut self, from: ThreadState, to: ThreadState) -> Result<()> {
        if self.state != from {
            return Err(CoreError::InvalidConfig(format!(
                "{} (vcpu {}) is {:?}, expected {:?}",
                self.name, self.vcpu_id, self.state, from
            )));
        }
        self.state = to;
        Ok(())
    }
}

pub(crate) fn child_name(index: u32) -> String {
    format!("thread[{index}]")
}

/// Instantiates the threads of a core.
///
/// The machine normally uses [`DefaultThreadFactory`]; alternative factories can refuse a
/// particular index to exercise construction rollback.
pub trait ThreadFactory {
    fn create_thread(&mut self, class: CpuClass, index: u32, vcpu_id: u32) -> Result<CpuThread>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn create_thread(&mut self, class: CpuClass, index: u32, vcpu_id: u32) -> Result<CpuThread> {
        Ok(CpuThread::new(class, index, vcpu_id))
    }
}

impl<F> ThreadFactory for F
where
    F: FnMut(CpuClass, u32, u32) -> Result<CpuThread>,
{
    fn create_thread(&mut self, class: CpuClass, index: u32, vcpu_id: u32) -> Result<CpuThread> {
        self(class, index, vcpu_id)
    }
}
