use std::fmt;

/// A resolved CPU model: the class every thread of a core is instantiated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuClass {
    name: &'static str,
    pvr: u32,
}

impl CpuClass {
    /// Canonical class name (e.g. `POWER8`).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Processor version register value reported to the guest.
    pub fn pvr(&self) -> u32 {
        self.pvr
    }
}

impl fmt::Display for CpuClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

const CLASSES: &[CpuClass] = &[
    CpuClass {
        name: "POWER7",
        pvr: 0x003F_0201,
    },
    CpuClass {
        name: "POWER7+",
        pvr: 0x004A_0201,
    },
    CpuClass {
        name: "POWER8E",
        pvr: 0x004B_0201,
    },
    CpuClass {
        name: "POWER8",
        pvr: 0x004D_0200,
    },
    CpuClass {
        name: "POWER8NVL",
        pvr: 0x004C_0100,
    },
    CpuClass {
        name: "POWER9",
        pvr: 0x004E_1200,
    },
];

// (alias, canonical name)
const ALIASES: &[(&str, &str)] = &[
    ("POWER7_v2.3", "POWER7"),
    ("POWER7+_v2.1", "POWER7+"),
    ("POWER8E_v2.1", "POWER8E"),
    ("POWER8_v2.0", "POWER8"),
    ("POWER8NVL_v1.0", "POWER8NVL"),
    ("POWER9_v2.0", "POWER9"),
    ("host", "POWER8"),
];

/// Resolves a user-facing model name or alias to its class. Matching is case-insensitive.
pub fn cpu_class_by_name(name: &str) -> Option<CpuClass> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
        .map(|&(_, canonical)| canonical)
        .unwrap_or(name);
    CLASSES
        .iter()
        .find(|class| class.name.eq_ignore_ascii_case(canonical))
        .copied()
}

/// All known classes, in table order.
pub fn cpu_classes() -> impl Iterator<Item = CpuClass> {
    CLASSES.iter().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_class() {
        assert_eq!(cpu_class_by_name("POWER8_v2.0").unwrap().name(), "POWER8");
        assert_eq!(cpu_class_by_name("host").unwrap().name(), "POWER8");
        assert_eq!(cpu_class_by_name("power9").unwrap().name(), "POWER9");
    }

    #[test]
    fn unknown_and_empty_names_do_not_resolve() {
        assert!(cpu_class_by_name("").is_none());
        assert!(cpu_class_by_name("  ").is_none());
        assert!(cpu_class_by_name("cortex-a57").is_none());
    }

    #[test]
    fn power7_plus_is_distinct_from_power7() {
        let p7 = cpu_class_by_name("POWER7").unwrap();
        let p7p = cpu_class_by_name("power7+").unwrap();
        assert_ne!(p7, p7p);
    }
}
