use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::MachineCpuConfig;
use crate::cpu_core::{CoreId, CpuCore};
use crate::drc::{
    drc_index, AllocationState, DrConnector, DrcKind, DrcTable, IsolationState, SimulatedDrc,
};
use crate::error::{CoreError, Result};
use crate::fdt::{CoreFragmentBuilder, FragmentBuilder};
use crate::notify::{HotplugEventQueue, HotplugNotifier};
use crate::registry::{slot_name, SlotRegistry, TopologyRegistry};
use crate::sched::RunQueue;
use crate::thread::CpuThread;

/// Offset of the `/cpus` node hot-added fragments are placed under.
pub const DEFAULT_CPUS_NODE_OFFSET: u32 = 0x40;

/// Properties of a core device-add request. Unset fields are left unset on the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreDeviceSpec {
    pub slot: Option<String>,
    pub nr_threads: Option<u32>,
    pub cpu_model: Option<String>,
}

impl CoreDeviceSpec {
    /// A request matching the machine's homogeneous configuration.
    pub fn for_slot(cfg: &MachineCpuConfig, slot: impl Into<String>) -> Self {
        Self {
            slot: Some(slot.into()),
            nr_threads: Some(cfg.smp_threads),
            cpu_model: Some(cfg.cpu_model.clone()),
        }
    }
}

/// Outcome of one release callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseSummary {
    pub core_id: CoreId,
    pub slot: String,
    /// Children staged for removal during enumeration.
    pub staged: usize,
    /// Children still attached once enumeration finished (before draining).
    pub live_after_staging: usize,
    pub destroyed: usize,
}

/// One possible core slot, as reported to management tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotpluggableCpu {
    pub slot: String,
    pub core_id: Option<CoreId>,
    pub vcpu_ids: Vec<u32>,
    pub drc_index: Option<u32>,
    pub allocation: Option<AllocationState>,
    pub isolation: Option<IsolationState>,
}

/// The board hosting CPU cores: owns the cores and the collaborators they plug into.
pub struct Machine {
    pub(crate) cfg: MachineCpuConfig,
    pub(crate) cores: BTreeMap<CoreId, CpuCore>,
    pub(crate) registry: SlotRegistry,
    pub(crate) sched: RunQueue,
    pub(crate) drcs: DrcTable,
    pub(crate) notifier: Box<dyn HotplugNotifier>,
    pub(crate) fragments: Box<dyn FragmentBuilder>,
    pub(crate) cpus_node_offset: u32,
    pub(crate) running: bool,
    pub(crate) releases: Vec<ReleaseSummary>,
    events: HotplugEventQueue,
    next_scratch_id: u32,
}

impl Machine {
    /// Builds a machine and cold-plugs its boot cores into `core[0..boot_cores]`.
    pub fn new(cfg: MachineCpuConfig) -> Result<Self> {
        let events = HotplugEventQueue::new();
        Self::with_notifier(cfg, Box::new(events.clone()), events)
    }

    fn with_notifier(
        cfg: MachineCpuConfig,
        notifier: Box<dyn HotplugNotifier>,
        events: HotplugEventQueue,
    ) -> Result<Self> {
        cfg.validate()
            .map_err(|err| CoreError::InvalidConfig(err.to_string()))?;

        let mut drcs = DrcTable::new();
        if cfg.dr_cpu_hotplug {
            for index in 0..cfg.max_cores {
                let guest_id = index.checked_mul(cfg.smp_threads).ok_or_else(|| {
                    CoreError::invalid("max_cores * smp_threads overflows vcpu ids")
                })?;
                let drc = SimulatedDrc::new(DrcKind::Cpu, guest_id);
                let connector_index = drc.index();
                if drcs.insert(Box::new(drc)).is_some() {
                    return Err(CoreError::InvalidConfig(format!(
                        "{} aliases drc {connector_index:#x} of another slot",
                        slot_name(index)
                    )));
                }
            }
        }

        let mut machine = Self {
            registry: SlotRegistry::with_core_slots(cfg.max_cores),
            next_scratch_id: cfg.max_cores,
            cfg,
            cores: BTreeMap::new(),
            sched: RunQueue::new(),
            drcs,
            notifier,
            fragments: Box::new(CoreFragmentBuilder),
            cpus_node_offset: DEFAULT_CPUS_NODE_OFFSET,
            running: false,
            releases: Vec::new(),
            events,
        };

        for index in 0..machine.cfg.boot_cores {
            let spec = CoreDeviceSpec::for_slot(&machine.cfg, slot_name(index));
            machine.device_add(&spec)?;
        }
        info!(
            boot_cores = machine.cfg.boot_cores,
            max_cores = machine.cfg.max_cores,
            smp_threads = machine.cfg.smp_threads,
            cpu_model = %machine.cfg.cpu_model,
            "machine initialized"
        );
        Ok(machine)
    }

    /// Variant of [`Machine::new`] delivering hotplug events to `notifier` instead of the
    /// built-in queue.
    pub fn with_hotplug_notifier(
        cfg: MachineCpuConfig,
        notifier: Box<dyn HotplugNotifier>,
    ) -> Result<Self> {
        Self::with_notifier(cfg, notifier, HotplugEventQueue::new())
    }

    pub fn set_fragment_builder(&mut self, builder: Box<dyn FragmentBuilder>) {
        self.fragments = builder;
    }

    /// Marks the guest as running. Cores added from now on take the hot-plug path.
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &MachineCpuConfig {
        &self.cfg
    }

    /// Creates a core from `spec`, realizes it and plugs it.
    ///
    /// Nothing about the core survives a failure: a realized-but-unplugged core has its slot
    /// link cleared and its threads unscheduled before the error is returned.
    pub fn device_add(&mut self, spec: &CoreDeviceSpec) -> Result<CoreId> {
        let id = self.allocate_core_id(spec.slot.as_deref());
        let mut core = CpuCore::new(id, self.cfg.clone());

        if let Some(slot) = &spec.slot {
            core.set_slot(slot)?;
        }
        if let Some(model) = &spec.cpu_model {
            core.set_cpu_model(model)?;
        }
        if let Some(count) = spec.nr_threads {
            core.set_thread_count(count)?;
        }

        if let Err(err) = core.realize(&mut self.registry, &mut self.sched) {
            if core.is_realized() {
                warn!(core_id = id.0, error = %err, "core realize failed; discarding core");
                core.unrealize(&mut self.registry, &mut self.sched);
            }
            return Err(err);
        }

        if let Err(err) = self.plug(&core) {
            warn!(core_id = id.0, error = %err, "core plug failed; reverting topology link");
            core.unrealize(&mut self.registry, &mut self.sched);
            return Err(err);
        }

        self.cores.insert(id, core);
        Ok(id)
    }

    /// Slot cores take the id matching their slot index so vCPU ids line up with the connectors
    /// created at init. Anything else gets an id past the slot range.
    fn allocate_core_id(&mut self, slot: Option<&str>) -> CoreId {
        let index = slot.and_then(|slot| (0..self.cfg.max_cores).find(|&i| slot_name(i) == slot));
        if let Some(index) = index {
            return CoreId(index);
        }
        let id = self.next_scratch_id;
        self.next_scratch_id = self.next_scratch_id.saturating_add(1);
        CoreId(id)
    }

    /// Guest acknowledgement of a hot-add: the resource is configured and put to use.
    pub fn guest_configure(&mut self, index: u32) -> Result<()> {
        let drc = self.connector_mut(index)?;
        drc.set_allocation_state(AllocationState::Usable);
        drc.set_isolation_state(IsolationState::Unisolated);
        Ok(())
    }

    /// Guest acknowledgement of a removal: the resource is isolated and given back.
    ///
    /// Only valid while a detach is in flight on the connector.
    pub fn guest_release(&mut self, index: u32) -> Result<()> {
        let drc = self.connector_mut(index)?;
        if !drc.detach_pending() {
            return Err(CoreError::ProtocolRejected(format!(
                "drc {index:#x} has no detach in progress"
            )));
        }
        drc.set_isolation_state(IsolationState::Isolated);
        drc.set_allocation_state(AllocationState::Unusable);
        Ok(())
    }

    fn connector_mut(&mut self, index: u32) -> Result<&mut (dyn DrConnector + 'static)> {
        self.drcs
            .get_mut(index)
            .ok_or_else(|| CoreError::TopologyConflict(format!("no drc {index:#x}")))
    }

    /// Runs the release callback of every connector whose detach has completed. Returns how
    /// many ran.
    pub fn process_pending_releases(&mut self) -> usize {
        let ready = self.drcs.take_ready_releases();
        let count = ready.len();
        for release in ready {
            (release.callback)(self, release.core);
        }
        count
    }

    pub fn core(&self, id: CoreId) -> Option<&CpuCore> {
        self.cores.get(&id)
    }

    pub fn core_by_slot(&self, slot: &str) -> Option<&CpuCore> {
        self.registry.link(slot).and_then(|id| self.cores.get(&id))
    }

    pub fn cores(&self) -> impl Iterator<Item = &CpuCore> {
        self.cores.values()
    }

    pub fn registry(&self) -> &SlotRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &RunQueue {
        &self.sched
    }

    pub fn scheduler_mut(&mut self) -> &mut RunQueue {
        &mut self.sched
    }

    pub fn drcs(&self) -> &DrcTable {
        &self.drcs
    }

    pub fn drcs_mut(&mut self) -> &mut DrcTable {
        &mut self.drcs
    }

    /// Events enqueued through the built-in notifier.
    pub fn hotplug_events(&self) -> &HotplugEventQueue {
        &self.events
    }

    pub fn take_release_summaries(&mut self) -> Vec<ReleaseSummary> {
        std::mem::take(&mut self.releases)
    }

    /// Every possible core slot with its current occupant and connector state.
    pub fn hotpluggable_cpus(&self) -> Vec<HotpluggableCpu> {
        (0..self.cfg.max_cores)
            .map(|index| {
                let slot = slot_name(index);
                let core = self.core_by_slot(&slot);
                let guest_id = index.saturating_mul(self.cfg.smp_threads);
                let drc = self.drcs.get(drc_index(DrcKind::Cpu, guest_id));
                HotpluggableCpu {
                    core_id: core.map(CpuCore::id),
                    vcpu_ids: core
                        .map(|c| c.threads().iter().map(CpuThread::vcpu_id).collect())
                        .unwrap_or_default(),
                    drc_index: drc.map(|d| d.index()),
                    allocation: drc.map(|d| d.allocation_state()),
                    isolation: drc.map(|d| d.isolation_state()),
                    slot,
                }
            })
            .collect()
    }
}
