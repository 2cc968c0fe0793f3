use serde::Serialize;

use crate::cpu_core::CpuCore;
use crate::drc::{drc_index, DrcKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FdtValue {
    Str(String),
    Cells(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdtProperty {
    pub name: String,
    pub value: FdtValue,
}

/// Device-tree node describing a hot-added core, handed to the connector on attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdtFragment {
    /// Offset of the parent node the fragment is placed under.
    pub offset: u32,
    pub node_name: String,
    pub properties: Vec<FdtProperty>,
}

impl FdtFragment {
    pub fn property(&self, name: &str) -> Option<&FdtValue> {
        self.properties
            .iter()
            .find(|prop| prop.name == name)
            .map(|prop| &prop.value)
    }
}

pub trait FragmentBuilder {
    fn build_fragment(&mut self, core: &CpuCore, tree_offset: u32) -> FdtFragment;
}

/// Emits a `cpus`-style node: `<model>@<guest id>` with one interrupt server per thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreFragmentBuilder;

impl FragmentBuilder for CoreFragmentBuilder {
    fn build_fragment(&mut self, core: &CpuCore, tree_offset: u32) -> FdtFragment {
        let guest_id = core.guest_id().unwrap_or(0);
        let model = core.cpu_model().unwrap_or("cpu");
        let servers: Vec<u32> = core.threads().iter().map(|t| t.vcpu_id()).collect();

        let mut properties = vec![
            FdtProperty {
                name: "device_type".into(),
                value: FdtValue::Str("cpu".into()),
            },
            FdtProperty {
                name: "reg".into(),
                value: FdtValue::Cells(vec![guest_id]),
            },
        ];
        if let Some(class) = core.cpu_class() {
            properties.push(FdtProperty {
                name: "cpu-version".into(),
                value: FdtValue::Cells(vec![class.pvr()]),
            });
        }
        properties.push(FdtProperty {
            name: "ibm,ppc-interrupt-server#s".into(),
            value: FdtValue::Cells(servers),
        });
        properties.push(FdtProperty {
            name: "ibm,my-drc-index".into(),
            value: FdtValue::Cells(vec![drc_index(DrcKind::Cpu, guest_id)]),
        });

        FdtFragment {
            offset: tree_offset,
            node_name: format!("PowerPC,{model}@{guest_id:x}"),
            properties,
        }
    }
}
