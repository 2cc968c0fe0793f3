//! Core plug / unplug against the machine's dynamic-reconfiguration connectors.
//!
//! Plug attaches the core to the connector for its first thread. Hot-plugged cores also get a
//! device-tree fragment and an `Add` notification; cold-plugged cores are simply marked usable
//! and unisolated, since firmware discovers them at boot.
//!
//! Unplug is two-phase. [`Machine::unplug`] asks the connector to detach and notifies the guest;
//! the connector later hands back [`release_core`] once the guest has isolated the resource, and
//! [`Machine::process_pending_releases`] runs it. Nothing is torn down before that point, and a
//! refused `attach`/`detach` always happens before any notification goes out.

use tracing::{debug, info};

use crate::cpu_core::{CoreId, CpuCore};
use crate::drc::{AllocationState, DrcKind, IsolationState};
use crate::error::{CoreError, Result};
use crate::machine::{Machine, ReleaseSummary};
use crate::notify::HotplugEvent;
use crate::registry::TopologyRegistry;
use crate::sched::VcpuScheduler;
use crate::unplug_list::UnplugList;

impl Machine {
    /// Attaches a realized core to its connector.
    ///
    /// The core must be realized and linked under its slot. A no-op on machines without DR CPU
    /// hotplug. On `attach` failure the error is returned unchanged and no notification is sent;
    /// reverting the slot link is up to the caller.
    pub fn plug(&mut self, core: &CpuCore) -> Result<()> {
        if !core.is_realized() {
            return Err(CoreError::invalid("can't plug a core that isn't realized"));
        }
        let linked = core
            .slot()
            .is_some_and(|slot| self.registry.link(slot) == Some(core.id()));
        if !linked {
            return Err(CoreError::InvalidConfig(format!(
                "core {} isn't linked under its slot",
                core.id().0
            )));
        }

        if !self.cfg.dr_cpu_hotplug {
            debug!(core_id = core.id().0, "DR CPU hotplug unsupported; skipping connector");
            return Ok(());
        }

        let guest_id = expect_guest_id(core);
        let hotplugged = self.running;
        let fdt = if hotplugged {
            Some(self.fragments.build_fragment(core, self.cpus_node_offset))
        } else {
            None
        };

        let Some(drc) = self.drcs.find_connector(DrcKind::Cpu, guest_id) else {
            panic!("no CPU DR connector for guest id {guest_id}");
        };
        drc.attach(core.id(), fdt, !hotplugged)?;
        let drc_index = drc.index();

        if hotplugged {
            self.notifier
                .enqueue_hotplug_event(HotplugEvent::add(DrcKind::Cpu, drc_index));
        } else {
            drc.set_allocation_state(AllocationState::Usable);
            drc.set_isolation_state(IsolationState::Unisolated);
        }

        info!(
            core_id = core.id().0,
            slot = core.slot().unwrap_or_default(),
            drc_index,
            hotplugged,
            "core plugged"
        );
        Ok(())
    }

    /// Requests removal of the core in `slot`.
    ///
    /// On success the core is still fully present: it goes away only once the guest completes
    /// the detach and [`Machine::process_pending_releases`] runs the release callback.
    pub fn unplug(&mut self, slot: &str) -> Result<()> {
        if !self.cfg.dr_cpu_hotplug {
            return Err(CoreError::invalid(
                "CPU hot-unplug is not supported on this machine",
            ));
        }
        let Some(core_id) = self.registry.link(slot) else {
            return Err(CoreError::TopologyConflict(format!("slot {slot} is empty")));
        };
        let Some(core) = self.cores.get(&core_id) else {
            panic!("slot {slot} links to missing core {}", core_id.0);
        };
        let guest_id = expect_guest_id(core);

        let Some(drc) = self.drcs.find_connector(DrcKind::Cpu, guest_id) else {
            panic!("no CPU DR connector for guest id {guest_id}");
        };
        drc.detach(core_id, release_core)?;
        let drc_index = drc.index();

        self.notifier
            .enqueue_hotplug_event(HotplugEvent::remove(DrcKind::Cpu, drc_index));
        info!(core_id = core_id.0, slot, drc_index, "core unplug requested");
        Ok(())
    }
}

fn expect_guest_id(core: &CpuCore) -> u32 {
    match core.guest_id() {
        Some(id) => id,
        None => panic!("core {} has no threads", core.id().0),
    }
}

/// Release callback handed to the connector on detach.
///
/// Threads are stopped, unscheduled and staged while the core's children are enumerated, then
/// destroyed once enumeration is over. The slot link is cleared last, followed by the core.
pub fn release_core(machine: &mut Machine, core_id: CoreId) {
    let Some(core) = machine.cores.get_mut(&core_id) else {
        panic!("release for unknown core {}", core_id.0);
    };
    let Some(slot) = core.slot().map(str::to_owned) else {
        panic!("released core {} has no slot", core_id.0);
    };

    let mut staged = UnplugList::new();
    for thread in core.threads_mut() {
        thread.stop();
        machine.sched.stop_vcpu(thread.vcpu_id());
        machine.sched.remove_vcpu(thread.vcpu_id());
        staged.stage(thread.index());
    }
    let staged_count = staged.len();
    let live_after_staging = core.threads().len();
    assert_eq!(
        live_after_staging, staged_count,
        "core {} lost children during enumeration",
        core_id.0
    );

    let mut destroyed = 0;
    for index in staged.drain() {
        if core.unparent_thread(index).is_none() {
            panic!("staged thread[{index}] vanished from core {}", core_id.0);
        }
        destroyed += 1;
    }

    if let Err(err) = machine.registry.set_link(&slot, None) {
        panic!("failed to clear slot {slot}: {err}");
    }
    core.release_thread_storage();
    machine.cores.remove(&core_id);

    info!(core_id = core_id.0, slot = %slot, destroyed, "core released");
    machine.releases.push(ReleaseSummary {
        core_id,
        slot,
        staged: staged_count,
        live_after_staging,
        destroyed,
    });
}
