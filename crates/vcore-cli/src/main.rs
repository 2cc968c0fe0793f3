#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use vcore::drc::drc_index;
use vcore::{CoreDeviceSpec, DrcKind, Machine, MachineCpuConfig};

#[derive(Debug, Parser)]
#[command(about = "Drive a simulated machine through CPU core hotplug and unplug")]
struct Args {
    /// JSON machine CPU configuration. `VCORE_*` environment variables and the flags below are
    /// applied on top of it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Threads per core.
    #[arg(long)]
    threads: Option<u32>,

    /// CPU model name or alias (e.g. `POWER9`, `host`).
    #[arg(long)]
    cpu_model: Option<String>,

    #[arg(long)]
    boot_cores: Option<u32>,

    #[arg(long)]
    max_cores: Option<u32>,

    /// Model a machine class without dynamic-reconfiguration CPU hotplug.
    #[arg(long)]
    no_dr_hotplug: bool,

    /// Hot-add a core into SLOT once the guest is running. May be repeated.
    #[arg(long = "hotplug", value_name = "SLOT")]
    hotplug: Vec<String>,

    /// Request removal of the core in SLOT. May be repeated.
    #[arg(long = "unplug", value_name = "SLOT")]
    unplug: Vec<String>,

    /// Leave unplug requests pending instead of acknowledging them on the guest's behalf.
    #[arg(long)]
    skip_guest_ack: bool,
}

fn load_config(args: &Args) -> Result<MachineCpuConfig> {
    let mut cfg = match &args.config {
        Some(path) => MachineCpuConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MachineCpuConfig::default(),
    };
    cfg.apply_env().context("invalid VCORE_* environment")?;

    if let Some(threads) = args.threads {
        cfg.smp_threads = threads;
    }
    if let Some(model) = &args.cpu_model {
        cfg.cpu_model = model.clone();
    }
    if let Some(boot_cores) = args.boot_cores {
        cfg.boot_cores = boot_cores;
    }
    if let Some(max_cores) = args.max_cores {
        cfg.max_cores = max_cores;
    }
    if args.no_dr_hotplug {
        cfg.dr_cpu_hotplug = false;
    }
    cfg.validate().context("invalid machine configuration")?;
    Ok(cfg)
}

fn run(args: &Args) -> Result<Value> {
    let cfg = load_config(args)?;
    let mut machine = Machine::new(cfg).context("failed to build machine")?;
    machine.start();

    let mut events = Vec::new();
    for slot in &args.hotplug {
        let spec = CoreDeviceSpec::for_slot(machine.config(), slot.as_str());
        let id = machine
            .device_add(&spec)
            .with_context(|| format!("hotplug of {slot} failed"))?;
        if machine.config().dr_cpu_hotplug {
            let guest_id = machine
                .core(id)
                .and_then(|core| core.guest_id())
                .ok_or_else(|| anyhow!("core in {slot} has no threads"))?;
            machine
                .guest_configure(drc_index(DrcKind::Cpu, guest_id))
                .with_context(|| format!("guest configure of {slot} failed"))?;
        }
        info!(slot = %slot, core_id = id.0, "core hot-added");
    }
    events.extend(machine.hotplug_events().drain());

    for slot in &args.unplug {
        let guest_id = machine
            .core_by_slot(slot)
            .and_then(|core| core.guest_id());
        machine
            .unplug(slot)
            .with_context(|| format!("unplug of {slot} failed"))?;
        if args.skip_guest_ack {
            continue;
        }
        if let Some(guest_id) = guest_id {
            machine
                .guest_release(drc_index(DrcKind::Cpu, guest_id))
                .with_context(|| format!("guest release of {slot} failed"))?;
        }
    }
    let released = machine.process_pending_releases();
    events.extend(machine.hotplug_events().drain());
    info!(released, "pending releases processed");

    Ok(json!({
        "hotpluggable_cpus": machine.hotpluggable_cpus(),
        "events": events,
        "releases": machine.take_release_summaries(),
    }))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let report = run(&args)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["vcore"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn repeated_slot_flags_accumulate() {
        let args = args(&[
            "--hotplug",
            "core[1]",
            "--hotplug",
            "core[2]",
            "--unplug",
            "core[1]",
        ]);
        assert_eq!(args.hotplug, vec!["core[1]", "core[2]"]);
        assert_eq!(args.unplug, vec!["core[1]"]);
        assert!(!args.skip_guest_ack);
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"smp_threads": 2, "cpu_model": "POWER9", "max_cores": 2}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let cfg = load_config(&args(&["--config", path, "--max-cores", "4"])).unwrap();
        assert_eq!(cfg.smp_threads, 2);
        assert_eq!(cfg.cpu_model, "POWER9");
        assert_eq!(cfg.max_cores, 4);
    }

    #[test]
    fn invalid_topology_is_rejected() {
        let err = load_config(&args(&["--boot-cores", "3", "--max-cores", "2"])).unwrap_err();
        assert!(format!("{err:#}").contains("exceeds max_cores"), "{err:#}");
    }

    #[test]
    fn hotplug_then_unplug_round_trip() {
        let report = run(&args(&[
            "--threads",
            "2",
            "--max-cores",
            "3",
            "--hotplug",
            "core[1]",
            "--hotplug",
            "core[2]",
            "--unplug",
            "core[1]",
        ]))
        .unwrap();

        let cpus = report["hotpluggable_cpus"].as_array().unwrap();
        assert_eq!(cpus.len(), 3);
        assert!(cpus[1]["core_id"].is_null());
        assert_eq!(cpus[2]["vcpu_ids"], json!([4, 5]));
        assert_eq!(report["events"].as_array().unwrap().len(), 3);
        assert_eq!(report["releases"][0]["destroyed"], 2);
    }

    #[test]
    fn skipped_ack_leaves_core_in_place() {
        let report = run(&args(&[
            "--max-cores",
            "2",
            "--hotplug",
            "core[1]",
            "--unplug",
            "core[1]",
            "--skip-guest-ack",
        ]))
        .unwrap();
        assert_eq!(report["hotpluggable_cpus"][1]["core_id"], 1);
        assert!(report["releases"].as_array().unwrap().is_empty());
    }
}
