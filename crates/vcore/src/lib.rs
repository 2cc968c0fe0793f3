//! Multi-threaded CPU cores as hotpluggable container devices.
//!
//! A [`CpuCore`] owns an ordered set of [`CpuThread`]s. The threads are created only once both
//! the thread count and the CPU model have been set (in either order), and creation is
//! all-or-nothing. Realizing a core links it into the machine topology under its slot and makes
//! its threads schedulable.
//!
//! [`Machine`] hosts the cores together with the collaborators they interact with: the slot
//! registry, the vCPU scheduler, one dynamic-reconfiguration connector per possible core and the
//! guest hotplug notification queue. It drives plug (cold or hot) and the two-phase unplug, in
//! which the actual teardown runs from a release callback after the guest has given the core up.
//!
//! All operations run on the single machine-management context; nothing here is `Send`.
#![forbid(unsafe_code)]

mod config;
mod cpu_core;
pub mod drc;
mod error;
pub mod fdt;
mod hotplug;
mod machine;
mod model;
pub mod notify;
mod registry;
mod sched;
mod thread;
mod unplug_list;

pub use crate::config::{MachineCpuConfig, DEFAULT_CPU_MODEL};
pub use crate::cpu_core::{CoreId, CpuCore};
pub use crate::drc::{
    AllocationState, DrConnector, DrcKind, DrcTable, IsolationState, ReleaseCallback,
    SimulatedDrc,
};
pub use crate::error::{ConfigError, CoreError, Result};
pub use crate::hotplug::release_core;
pub use crate::machine::{
    CoreDeviceSpec, HotpluggableCpu, Machine, ReleaseSummary, DEFAULT_CPUS_NODE_OFFSET,
};
pub use crate::model::{cpu_class_by_name, cpu_classes, CpuClass};
pub use crate::notify::{HotplugEvent, HotplugEventKind, HotplugEventQueue, HotplugNotifier};
pub use crate::registry::{slot_name, SlotRegistry, TopologyRegistry};
pub use crate::sched::{RunQueue, VcpuScheduler};
pub use crate::thread::{CpuThread, DefaultThreadFactory, ThreadFactory, ThreadState};
pub use crate::unplug_list::UnplugList;
