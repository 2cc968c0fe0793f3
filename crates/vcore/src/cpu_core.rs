use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MachineCpuConfig;
use crate::error::{CoreError, Result};
use crate::model::{cpu_class_by_name, CpuClass};
use crate::registry::TopologyRegistry;
use crate::sched::VcpuScheduler;
use crate::thread::{CpuThread, DefaultThreadFactory, ThreadFactory, ThreadState};

/// Machine-assigned identity of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CoreId(pub u32);

/// The two inputs thread population waits for. Whichever arrives second completes the gate.
#[derive(Debug, Default, Clone, Copy)]
struct ConstructionGate {
    thread_count: Option<u32>,
    class: Option<CpuClass>,
}

impl ConstructionGate {
    fn ready(&self) -> Option<(u32, CpuClass)> {
        let count = self.thread_count.filter(|&n| n > 0)?;
        Some((count, self.class?))
    }
}

/// A multi-threaded CPU package: container device owning an ordered sequence of threads.
///
/// `threads` is either empty or holds exactly `thread_count` entries.
pub struct CpuCore {
    id: CoreId,
    machine: MachineCpuConfig,
    slot: Option<String>,
    gate: ConstructionGate,
    threads: Vec<CpuThread>,
    factory: Box<dyn ThreadFactory>,
    realized: bool,
}

impl fmt::Debug for CpuCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuCore")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("thread_count", &self.gate.thread_count)
            .field("cpu_model", &self.gate.class.map(|c| c.name()))
            .field("threads", &self.threads.len())
            .field("realized", &self.realized)
            .finish()
    }
}

impl CpuCore {
    pub fn new(id: CoreId, machine: MachineCpuConfig) -> Self {
        Self::with_factory(id, machine, Box::new(DefaultThreadFactory))
    }

    pub fn with_factory(
        id: CoreId,
        machine: MachineCpuConfig,
        factory: Box<dyn ThreadFactory>,
    ) -> Self {
        Self {
            id,
            machine,
            slot: None,
            gate: ConstructionGate::default(),
            threads: Vec::new(),
            factory,
            realized: false,
        }
    }

    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Configured thread count, or 0 while unset.
    pub fn thread_count(&self) -> u32 {
        self.gate.thread_count.unwrap_or(0)
    }

    /// Canonical class name of the configured model.
    pub fn cpu_model(&self) -> Option<&'static str> {
        self.gate.class.map(|c| c.name())
    }

    pub fn cpu_class(&self) -> Option<CpuClass> {
        self.gate.class
    }

    pub fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }

    pub fn threads(&self) -> &[CpuThread] {
        &self.threads
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    /// Guest-visible CPU identifier: the vCPU id of `threads[0]`.
    pub fn guest_id(&self) -> Option<u32> {
        self.threads.first().map(CpuThread::vcpu_id)
    }

    pub fn set_slot(&mut self, slot: &str) -> Result<()> {
        self.ensure_unrealized("slot")?;
        if slot.is_empty() {
            return Err(CoreError::invalid("slot name can't be empty"));
        }
        if let Some(existing) = &self.slot {
            return Err(CoreError::InvalidConfig(format!(
                "slot is already set to {existing}"
            )));
        }
        debug!(core_id = self.id.0, slot, "set slot");
        self.slot = Some(slot.to_string());
        Ok(())
    }

    /// Sets the number of threads. Only the machine-wide thread count is accepted.
    pub fn set_thread_count(&mut self, count: u32) -> Result<()> {
        self.ensure_unpopulated("nr_threads")?;
        if count != self.machine.smp_threads {
            return Err(CoreError::InvalidConfig(format!(
                "nr_threads must be {}",
                self.machine.smp_threads
            )));
        }
        debug!(core_id = self.id.0, count, "set nr_threads");
        let previous = self.gate.thread_count.replace(count);
        if let Err(err) = self.try_complete_construction() {
            self.gate.thread_count = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Sets the CPU model. It must resolve to the machine's configured class.
    pub fn set_cpu_model(&mut self, model: &str) -> Result<()> {
        self.ensure_unpopulated("cpu_model")?;
        let Some(class) = cpu_class_by_name(model) else {
            return Err(CoreError::InvalidConfig(format!("Unknown CPU model {model}")));
        };
        if self.machine.cpu_class() != Some(class) {
            return Err(CoreError::InvalidConfig(format!(
                "cpu_model must be {}",
                self.machine.cpu_model
            )));
        }
        debug!(core_id = self.id.0, cpu_model = class.name(), "set cpu_model");
        let previous = self.gate.class.replace(class);
        if let Err(err) = self.try_complete_construction() {
            self.gate.class = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Populates the thread sequence once both gate inputs are present.
    ///
    /// A no-op while either input is missing. Threads are built off to the side and only
    /// installed when every one of them attached, so a failure leaves `threads` empty.
    fn try_complete_construction(&mut self) -> Result<()> {
        let Some((count, class)) = self.gate.ready() else {
            return Ok(());
        };
        if !self.threads.is_empty() {
            return Ok(());
        }

        let base = self
            .id
            .0
            .checked_mul(count)
            .filter(|base| base.checked_add(count - 1).is_some())
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!("core {} vcpu ids overflow", self.id.0))
            })?;

        let mut threads: Vec<CpuThread> = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.attach_thread(&threads, class, index, base + index) {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    warn!(
                        core_id = self.id.0,
                        index,
                        attached = threads.len(),
                        error = %err,
                        "thread construction failed; rolling back"
                    );
                    for thread in threads.iter_mut().rev() {
                        thread.destroy();
                    }
                    return Err(err);
                }
            }
        }

        info!(
            core_id = self.id.0,
            count,
            cpu_model = class.name(),
            "core threads created"
        );
        self.threads = threads;
        Ok(())
    }

    fn attach_thread(
        &mut self,
        siblings: &[CpuThread],
        class: CpuClass,
        index: u32,
        vcpu_id: u32,
    ) -> Result<CpuThread> {
        let mut thread = self.factory.create_thread(class, index, vcpu_id)?;
        if siblings.iter().any(|t| t.name() == thread.name()) {
            return Err(CoreError::InvalidConfig(format!(
                "duplicate child {}",
                thread.name()
            )));
        }
        thread.construct()?;
        Ok(thread)
    }

    /// Realizes the container: links it under its slot, then realizes and schedules every
    /// thread in index order.
    ///
    /// A thread failing to realize stops the sequence; threads realized before it, and the slot
    /// link, are left in place.
    pub fn realize(
        &mut self,
        registry: &mut dyn TopologyRegistry,
        sched: &mut dyn VcpuScheduler,
    ) -> Result<()> {
        if self.realized {
            return Err(CoreError::invalid("core is already realized"));
        }
        if self.thread_count() == 0 {
            return Err(CoreError::invalid("nr_threads property can't be 0"));
        }
        if self.gate.class.is_none() {
            return Err(CoreError::invalid("cpu_model property isn't set"));
        }
        let Some(slot) = self.slot.clone() else {
            return Err(CoreError::invalid("slot property isn't set"));
        };
        assert_eq!(
            self.threads.len(),
            self.thread_count() as usize,
            "core {} has a malformed thread sequence",
            self.id.0
        );

        registry.set_link(&slot, Some(self.id))?;
        self.realized = true;
        info!(core_id = self.id.0, slot = %slot, "core linked");

        for thread in &mut self.threads {
            thread.realize()?;
            sched.add_vcpu(thread.vcpu_id())?;
            debug!(
                core_id = self.id.0,
                thread = thread.index(),
                vcpu_id = thread.vcpu_id(),
                "thread realized"
            );
        }
        Ok(())
    }

    /// Reverses a realization that was not followed by a committed plug.
    ///
    /// Panics if the slot link this core established can't be cleared.
    pub(crate) fn unrealize(
        &mut self,
        registry: &mut dyn TopologyRegistry,
        sched: &mut dyn VcpuScheduler,
    ) {
        for thread in &mut self.threads {
            if sched.is_scheduled(thread.vcpu_id()) {
                sched.stop_vcpu(thread.vcpu_id());
                sched.remove_vcpu(thread.vcpu_id());
            }
            thread.stop();
        }
        if let Some(slot) = &self.slot {
            if let Err(err) = registry.set_link(slot, None) {
                panic!("core {} failed to clear slot {slot}: {err}", self.id.0);
            }
        }
        self.realized = false;
    }

    pub(crate) fn threads_mut(&mut self) -> impl Iterator<Item = &mut CpuThread> {
        self.threads.iter_mut()
    }

    /// Detaches and destroys the child with architectural index `index`.
    pub(crate) fn unparent_thread(&mut self, index: u32) -> Option<CpuThread> {
        let pos = self.threads.iter().position(|t| t.index() == index)?;
        let mut thread = self.threads.remove(pos);
        thread.destroy();
        Some(thread)
    }

    /// Frees the (now empty) thread storage.
    pub(crate) fn release_thread_storage(&mut self) {
        debug_assert!(self
            .threads
            .iter()
            .all(|t| t.state() == ThreadState::Destroyed));
        self.threads = Vec::new();
        self.realized = false;
    }

    fn ensure_unrealized(&self, prop: &str) -> Result<()> {
        if self.realized {
            return Err(CoreError::InvalidConfig(format!(
                "{prop} can't be changed on a realized core"
            )));
        }
        Ok(())
    }

    fn ensure_unpopulated(&self, prop: &str) -> Result<()> {
        self.ensure_unrealized(prop)?;
        if !self.threads.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "{prop} can't be changed once threads are created"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotRegistry;
    use crate::sched::RunQueue;

    fn machine(threads: u32) -> MachineCpuConfig {
        MachineCpuConfig {
            smp_threads: threads,
            max_cores: 4,
            ..Default::default()
        }
    }

    #[test]
    fn vcpu_ids_are_offset_by_core_id() {
        let mut core = CpuCore::new(CoreId(2), machine(4));
        core.set_thread_count(4).unwrap();
        core.set_cpu_model("POWER8").unwrap();
        let ids: Vec<u32> = core.threads().iter().map(CpuThread::vcpu_id).collect();
        assert_eq!(ids, vec![8, 9, 10, 11]);
        assert_eq!(core.guest_id(), Some(8));
    }

    #[test]
    fn setters_are_rejected_once_threads_exist() {
        let mut core = CpuCore::new(CoreId(0), machine(2));
        core.set_thread_count(2).unwrap();
        core.set_cpu_model("POWER8").unwrap();
        assert!(core.set_thread_count(2).is_err());
        assert!(core.set_cpu_model("POWER8").is_err());
        assert_eq!(core.threads().len(), 2);
    }

    #[test]
    fn slot_can_only_be_set_once() {
        let mut core = CpuCore::new(CoreId(0), machine(1));
        assert!(core.set_slot("").is_err());
        core.set_slot("core[0]").unwrap();
        assert!(core.set_slot("core[1]").is_err());
        assert_eq!(core.slot(), Some("core[0]"));
    }

    #[test]
    fn failed_population_reverts_the_triggering_input() {
        let factory = |class: CpuClass, index: u32, vcpu_id: u32| -> Result<CpuThread> {
            if index == 1 {
                Err(CoreError::invalid("no room"))
            } else {
                Ok(CpuThread::new(class, index, vcpu_id))
            }
        };
        let mut core = CpuCore::with_factory(CoreId(0), machine(2), Box::new(factory));
        core.set_cpu_model("POWER8").unwrap();
        assert!(core.set_thread_count(2).is_err());
        assert_eq!(core.thread_count(), 0);
        assert_eq!(core.cpu_model(), Some("POWER8"));
        assert!(core.threads().is_empty());
    }

    #[test]
    fn unrealize_clears_link_and_schedule() {
        let mut reg = SlotRegistry::with_core_slots(1);
        let mut rq = RunQueue::new();
        let mut core = CpuCore::new(CoreId(0), machine(2));
        core.set_slot("core[0]").unwrap();
        core.set_thread_count(2).unwrap();
        core.set_cpu_model("POWER8").unwrap();
        core.realize(&mut reg, &mut rq).unwrap();
        assert_eq!(rq.len(), 2);

        core.unrealize(&mut reg, &mut rq);
        assert!(rq.is_empty());
        assert_eq!(reg.link("core[0]"), None);
        assert!(!core.is_realized());
    }
}
