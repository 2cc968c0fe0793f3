//! Dynamic-reconfiguration connectors (DRCs).
//!
//! A connector is the per-resource gate the guest negotiates hotplug through. The hotplug
//! coordinator only drives the [`DrConnector`] contract; [`SimulatedDrc`] is the in-process
//! implementation used by [`crate::Machine`].

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::cpu_core::CoreId;
use crate::error::{CoreError, Result};
use crate::fdt::FdtFragment;
use crate::machine::Machine;

/// Connector type field occupies the top 4 bits of a DRC index.
pub const DRC_TYPE_SHIFT: u32 = 28;
pub const DRC_TYPE_CPU: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DrcKind {
    Cpu,
}

impl DrcKind {
    fn type_bits(self) -> u32 {
        match self {
            DrcKind::Cpu => DRC_TYPE_CPU,
        }
    }
}

/// Guest-visible connector index for `(kind, id)`.
pub fn drc_index(kind: DrcKind, id: u32) -> u32 {
    (kind.type_bits() << DRC_TYPE_SHIFT) | (id & ((1 << DRC_TYPE_SHIFT) - 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationState {
    Unusable,
    Usable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IsolationState {
    Isolated,
    Unisolated,
}

/// Continuation run once a detach has been fully negotiated with the guest.
pub type ReleaseCallback = fn(&mut Machine, CoreId);

/// A negotiated detach whose release callback is due.
#[derive(Debug, Clone, Copy)]
pub struct PendingRelease {
    pub core: CoreId,
    pub callback: ReleaseCallback,
}

pub trait DrConnector {
    fn index(&self) -> u32;

    fn kind(&self) -> DrcKind;

    /// Core currently attached, if any.
    fn attached(&self) -> Option<CoreId>;

    fn attach(&mut self, core: CoreId, fdt: Option<FdtFragment>, coldplug: bool) -> Result<()>;

    /// Device-tree fragment handed over by the last hot attach.
    fn fdt(&self) -> Option<&FdtFragment>;

    /// Starts a detach. `release` is held until the guest has given the resource up.
    fn detach(&mut self, core: CoreId, release: ReleaseCallback) -> Result<()>;

    /// Whether a detach has been requested and its release not yet handed back.
    fn detach_pending(&self) -> bool;

    fn set_allocation_state(&mut self, state: AllocationState);

    fn set_isolation_state(&mut self, state: IsolationState);

    fn allocation_state(&self) -> AllocationState;

    fn isolation_state(&self) -> IsolationState;

    /// Hands back the release callback once the detach has completed on the guest side.
    fn take_ready_release(&mut self) -> Option<PendingRelease>;
}

/// In-process connector state machine.
///
/// `attach` is refused while a core is attached or a detach is in flight; `detach` is refused
/// when nothing (or a different core) is attached, or when a detach is already in flight. A
/// pending release becomes ready when the resource is both isolated and unusable.
#[derive(Debug)]
pub struct SimulatedDrc {
    index: u32,
    kind: DrcKind,
    core: Option<CoreId>,
    fdt: Option<FdtFragment>,
    allocation: AllocationState,
    isolation: IsolationState,
    pending: Option<PendingRelease>,
}

impl SimulatedDrc {
    pub fn new(kind: DrcKind, id: u32) -> Self {
        Self {
            index: drc_index(kind, id),
            kind,
            core: None,
            fdt: None,
            allocation: AllocationState::Unusable,
            isolation: IsolationState::Isolated,
            pending: None,
        }
    }

}

impl DrConnector for SimulatedDrc {
    fn index(&self) -> u32 {
        self.index
    }

    fn kind(&self) -> DrcKind {
        self.kind
    }

    fn attached(&self) -> Option<CoreId> {
        self.core
    }

    fn attach(&mut self, core: CoreId, fdt: Option<FdtFragment>, coldplug: bool) -> Result<()> {
        if let Some(existing) = self.core {
            return Err(CoreError::ProtocolRejected(format!(
                "drc {:#x} is already attached to core {}",
                self.index, existing.0
            )));
        }
        debug!(drc_index = self.index, core_id = core.0, coldplug, "drc attach");
        self.core = Some(core);
        self.fdt = fdt;
        Ok(())
    }

    fn fdt(&self) -> Option<&FdtFragment> {
        self.fdt.as_ref()
    }

    fn detach(&mut self, core: CoreId, release: ReleaseCallback) -> Result<()> {
        if self.core != Some(core) {
            return Err(CoreError::ProtocolRejected(format!(
                "drc {:#x} has no core {} attached",
                self.index, core.0
            )));
        }
        if self.pending.is_some() {
            return Err(CoreError::ProtocolRejected(format!(
                "drc {:#x} already has a detach in progress",
                self.index
            )));
        }
        debug!(drc_index = self.index, core_id = core.0, "drc detach requested");
        self.pending = Some(PendingRelease {
            core,
            callback: release,
        });
        Ok(())
    }

    fn detach_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn set_allocation_state(&mut self, state: AllocationState) {
        self.allocation = state;
    }

    fn set_isolation_state(&mut self, state: IsolationState) {
        self.isolation = state;
    }

    fn allocation_state(&self) -> AllocationState {
        self.allocation
    }

    fn isolation_state(&self) -> IsolationState {
        self.isolation
    }

    fn take_ready_release(&mut self) -> Option<PendingRelease> {
        if self.isolation != IsolationState::Isolated
            || self.allocation != AllocationState::Unusable
        {
            return None;
        }
        let pending = self.pending.take()?;
        self.core = None;
        self.fdt = None;
        Some(pending)
    }
}

/// Connectors of a machine, keyed by DRC index.
#[derive(Default)]
pub struct DrcTable {
    connectors: BTreeMap<u32, Box<dyn DrConnector>>,
}

impl DrcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a connector, returning the previous one at that index.
    pub fn insert(&mut self, drc: Box<dyn DrConnector>) -> Option<Box<dyn DrConnector>> {
        self.connectors.insert(drc.index(), drc)
    }

    pub fn remove(&mut self, index: u32) -> Option<Box<dyn DrConnector>> {
        self.connectors.remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<&dyn DrConnector> {
        self.connectors.get(&index).map(|drc| drc.as_ref())
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut (dyn DrConnector + 'static)> {
        self.connectors.get_mut(&index).map(|drc| drc.as_mut())
    }

    pub fn find_connector(
        &mut self,
        kind: DrcKind,
        id: u32,
    ) -> Option<&mut (dyn DrConnector + 'static)> {
        self.get_mut(drc_index(kind, id))
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn DrConnector> {
        self.connectors.values().map(|drc| drc.as_ref())
    }

    /// Collects every release that is ready, in index order.
    pub(crate) fn take_ready_releases(&mut self) -> Vec<PendingRelease> {
        self.connectors
            .values_mut()
            .filter_map(|drc| drc.take_ready_release())
            .collect()
    }
}
