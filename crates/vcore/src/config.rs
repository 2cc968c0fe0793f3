use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::drc::DRC_TYPE_SHIFT;
use crate::error::ConfigError;
use crate::model::{cpu_class_by_name, CpuClass};

pub const DEFAULT_CPU_MODEL: &str = "POWER8";

/// Machine-wide CPU topology configuration.
///
/// Every core in a machine shares one thread count and one CPU model. The configuration is
/// handed to each [`crate::CpuCore`] explicitly so core validation never consults global state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineCpuConfig {
    /// Threads per core (SMT width). Must be >= 1.
    pub smp_threads: u32,
    /// CPU model name or alias; resolved through [`cpu_class_by_name`].
    pub cpu_model: String,
    /// Cores present at boot. Must be >= 1 and <= `max_cores`.
    pub boot_cores: u32,
    /// Number of core slots the machine exposes (boot cores plus hotpluggable capacity).
    pub max_cores: u32,
    /// Whether the machine class supports dynamic-reconfiguration CPU hotplug.
    ///
    /// When `false`, plugging a core brings it up without any connector interaction.
    pub dr_cpu_hotplug: bool,
}

impl Default for MachineCpuConfig {
    fn default() -> Self {
        Self {
            smp_threads: 1,
            cpu_model: DEFAULT_CPU_MODEL.to_string(),
            boot_cores: 1,
            max_cores: 1,
            dr_cpu_hotplug: true,
        }
    }
}

impl MachineCpuConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Overlays `VCORE_*` environment variables on top of `self`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(raw) = get("VCORE_SMP_THREADS") {
            self.smp_threads = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VCORE_SMP_THREADS"))?;
        }
        if let Some(raw) = get("VCORE_CPU_MODEL") {
            self.cpu_model = raw.trim().to_string();
        }
        if let Some(raw) = get("VCORE_BOOT_CORES") {
            self.boot_cores = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VCORE_BOOT_CORES"))?;
        }
        if let Some(raw) = get("VCORE_MAX_CORES") {
            self.max_cores = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VCORE_MAX_CORES"))?;
        }
        if let Some(raw) = get("VCORE_DR_CPU_HOTPLUG") {
            self.dr_cpu_hotplug = match raw.trim() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => return Err(ConfigError::InvalidEnv("VCORE_DR_CPU_HOTPLUG")),
            };
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smp_threads == 0 {
            return Err(ConfigError::Invalid("smp_threads must be >= 1".into()));
        }
        if self.boot_cores == 0 {
            return Err(ConfigError::Invalid("boot_cores must be >= 1".into()));
        }
        if self.boot_cores > self.max_cores {
            return Err(ConfigError::Invalid(format!(
                "boot_cores={} exceeds max_cores={}",
                self.boot_cores, self.max_cores
            )));
        }
        if self.cpu_class().is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown cpu_model {}",
                self.cpu_model
            )));
        }
        // Every vCPU id must fit the id field of a connector index.
        let vcpus = u64::from(self.max_cores) * u64::from(self.smp_threads);
        if vcpus > 1u64 << DRC_TYPE_SHIFT {
            return Err(ConfigError::Invalid(format!(
                "max_cores={} * smp_threads={} exceeds {} vcpu ids",
                self.max_cores,
                self.smp_threads,
                1u64 << DRC_TYPE_SHIFT
            )));
        }
        Ok(())
    }

    /// The class every core of this machine must use.
    pub fn cpu_class(&self) -> Option<CpuClass> {
        cpu_class_by_name(&self.cpu_model)
    }
}
