use std::collections::BTreeMap;

use crate::cpu_core::CoreId;
use crate::error::{CoreError, Result};

/// Non-owning index of cores by placement name.
pub trait TopologyRegistry {
    /// Links `slot` to `core`, or clears the link when `core` is `None`.
    ///
    /// Linking an occupied slot fails with [`CoreError::TopologyConflict`]. Clearing an empty slot
    /// succeeds.
    fn set_link(&mut self, slot: &str, core: Option<CoreId>) -> Result<()>;

    fn link(&self, slot: &str) -> Option<CoreId>;
}

/// [`TopologyRegistry`] over a fixed set of named slots.
#[derive(Debug, Clone, Default)]
pub struct SlotRegistry {
    slots: BTreeMap<String, Option<CoreId>>,
}

impl SlotRegistry {
    /// Creates `count` empty slots named `core[0]..core[count-1]`.
    pub fn with_core_slots(count: u32) -> Self {
        Self {
            slots: (0..count).map(|i| (slot_name(i), None)).collect(),
        }
    }

    pub fn contains_slot(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    /// All slots with their current link, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<CoreId>)> {
        self.slots.iter().map(|(name, link)| (name.as_str(), *link))
    }

    pub fn occupied(&self) -> usize {
        self.slots.values().filter(|link| link.is_some()).count()
    }
}

impl TopologyRegistry for SlotRegistry {
    fn set_link(&mut self, slot: &str, core: Option<CoreId>) -> Result<()> {
        let Some(link) = self.slots.get_mut(slot) else {
            return Err(CoreError::TopologyConflict(format!("no such slot {slot}")));
        };
        match (core, *link) {
            (Some(_), Some(existing)) => Err(CoreError::TopologyConflict(format!(
                "slot {slot} is already occupied by core {}",
                existing.0
            ))),
            (Some(new), _) => {
                *link = Some(new);
                Ok(())
            }
            (None, _) => {
                *link = None;
                Ok(())
            }
        }
    }

    fn link(&self, slot: &str) -> Option<CoreId> {
        self.slots.get(slot).copied().flatten()
    }
}

/// Placement name of the `index`-th core slot.
pub fn slot_name(index: u32) -> String {
    format!("core[{index}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupied_slot_rejects_a_second_core() {
        let mut reg = SlotRegistry::with_core_slots(2);
        reg.set_link("core[1]", Some(CoreId(1))).unwrap();
        let err = reg.set_link("core[1]", Some(CoreId(7))).unwrap_err();
        assert!(matches!(err, CoreError::TopologyConflict(_)));
        assert_eq!(reg.link("core[1]"), Some(CoreId(1)));
    }

    #[test]
    fn clearing_is_idempotent() {
        let mut reg = SlotRegistry::with_core_slots(1);
        reg.set_link("core[0]", None).unwrap();
        reg.set_link("core[0]", Some(CoreId(0))).unwrap();
        reg.set_link("core[0]", None).unwrap();
        reg.set_link("core[0]", None).unwrap();
        assert_eq!(reg.occupied(), 0);
    }

    #[test]
    fn unknown_slot_is_a_conflict() {
        let mut reg = SlotRegistry::with_core_slots(1);
        assert!(reg.set_link("socket[0]", Some(CoreId(0))).is_err());
    }
}
