// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! `hotplugd`: runs the core hotplug governor and takes commands on stdin.
//!
//! Each stdin line is one command (`help` lists them). Replies go to stdout,
//! logs to stderr.

mod commands;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use commands::Command;
use hotplug_control::{Governor, HotplugService, Tunables, TunablesSnapshot};
use hotplug_core::{CoreActuator, CoreTelemetry, MonotonicClock};
use hotplug_infra::sysfs::{PROC_STAT, SYSFS_CPU_ROOT};
use hotplug_infra::{SimulatedCpus, SysfsCpus};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Clock rate simulated cores start at (kHz).
const SIMULATED_CLOCK_KHZ: u64 = 1_512_000;

#[derive(Parser, Debug)]
#[command(name = "hotplugd", version)]
#[command(about = "Brings CPU cores online and offline as the load changes")]
struct Args {
    /// TOML file with tunables applied at start-up.
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// Root of the CPU sysfs tree.
    #[arg(long, value_name = "DIR", default_value = SYSFS_CPU_ROOT)]
    sysfs_root: PathBuf,

    /// Scheduler statistics file providing `procs_running`.
    #[arg(long, value_name = "FILE", default_value = PROC_STAT)]
    proc_stat: PathBuf,

    /// Drive N simulated cores instead of the machine's own.
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Start with the governor switched off.
    #[arg(long)]
    disabled: bool,
}

/// The backend the governor drives.
struct Platform {
    cores: usize,
    telemetry: Arc<dyn CoreTelemetry>,
    actuator: Arc<dyn CoreActuator>,
    simulated: Option<Arc<SimulatedCpus>>,
}

impl Platform {
    fn open(args: &Args) -> Result<Self> {
        if let Some(cores) = args.simulate {
            return Self::simulated(cores);
        }
        let cpus = Arc::new(SysfsCpus::new(
            args.sysfs_root.clone(),
            args.proc_stat.clone(),
        ));
        let cores = cpus
            .possible_cores()
            .with_context(|| format!("counting cores under {}", args.sysfs_root.display()))?;
        log::info!(
            "Driving {} cores under {}.",
            cores,
            args.sysfs_root.display()
        );
        Ok(Self {
            cores,
            telemetry: cpus.clone(),
            actuator: cpus,
            simulated: None,
        })
    }

    fn simulated(cores: usize) -> Result<Self> {
        if cores == 0 {
            bail!("--simulate needs at least one core");
        }
        let cpus = Arc::new(SimulatedCpus::new(cores, SIMULATED_CLOCK_KHZ));
        log::info!("Simulating {} cores.", cores);
        Ok(Self {
            cores,
            telemetry: cpus.clone(),
            actuator: cpus.clone(),
            simulated: Some(cpus),
        })
    }
}

/// Applies the tunables in the TOML file at `path`.
fn load_config(path: &Path, tunables: &Tunables) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: TunablesSnapshot =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    tunables
        .apply(&snapshot)
        .with_context(|| format!("applying {}", path.display()))?;
    log::info!("Applied tunables from {}.", path.display());
    Ok(())
}

/// Runs one command against the service, writing the reply to `out`.
fn execute(
    service: &HotplugService,
    simulated: Option<&SimulatedCpus>,
    command: Command,
    out: &mut dyn Write,
) -> Result<()> {
    let simulation = || simulated.ok_or_else(|| anyhow!("only available with --simulate"));

    match command {
        Command::Suspend => {
            service.suspend();
            writeln!(out, "ok")?;
        }
        Command::Resume => {
            service.resume();
            writeln!(out, "ok")?;
        }
        Command::Enable => {
            let reply = if service.enable() { "enabled" } else { "already enabled" };
            writeln!(out, "{reply}")?;
        }
        Command::Disable => {
            let reply = if service.disable() { "disabled" } else { "already disabled" };
            writeln!(out, "{reply}")?;
        }
        Command::Get(key) => writeln!(out, "{}", service.get(&key)?)?,
        Command::Set(key, value) => {
            service.set(&key, &value)?;
            writeln!(out, "ok")?;
        }
        Command::Keys => {
            writeln!(out, "enabled = {}", service.get("enabled")?)?;
            for key in service.tunables().keys() {
                writeln!(out, "{key} = {}", service.get(&key)?)?;
            }
        }
        Command::Stats { json: true } => writeln!(out, "{}", service.stats().to_json()?)?,
        Command::Stats { json: false } => {
            let stats = service.stats();
            write!(out, "time_cpus_on:\n{}", stats.time_cpus_on())?;
            write!(out, "times_cpus_hotplugged:\n{}", stats.times_cpus_hotplugged())?;
            write!(out, "times_cpus_unplugged:\n{}", stats.times_cpus_unplugged())?;
        }
        Command::Load(depth) => {
            simulation()?.set_queue_depth(depth);
            writeln!(out, "ok")?;
        }
        Command::Freq(core, khz) => {
            let cpus = simulation()?;
            if core >= cpus.core_count() {
                bail!("no core {core}");
            }
            cpus.set_clock_rate(core, khz);
            writeln!(out, "ok")?;
        }
        Command::Help => writeln!(out, "{}", commands::HELP)?,
        Command::Quit => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let platform = Platform::open(&args)?;
    let tunables = Arc::new(Tunables::new(platform.cores)?);
    if let Some(path) = &args.config {
        load_config(path, &tunables)?;
    }

    let governor = Arc::new(Governor::new(
        tunables,
        platform.telemetry.clone(),
        platform.actuator.clone(),
        Arc::new(MonotonicClock::new()),
        !args.disabled,
    ));
    let mut service = HotplugService::start(governor)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let result = match commands::parse(&line) {
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => execute(&service, platform.simulated.as_deref(), command, &mut out),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            writeln!(out, "error: {err:#}")?;
        }
        out.flush()?;
    }

    service.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(service: &HotplugService, cpus: &SimulatedCpus, line: &str) -> String {
        let command = commands::parse(line).unwrap().unwrap();
        let mut out = Vec::new();
        execute(service, Some(cpus), command, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn simulated_service(cores: usize) -> (HotplugService, Arc<SimulatedCpus>) {
        let platform = Platform::simulated(cores).unwrap();
        let cpus = platform.simulated.clone().unwrap();
        let tunables = Arc::new(Tunables::new(platform.cores).unwrap());
        let governor = Arc::new(Governor::new(
            tunables,
            platform.telemetry,
            platform.actuator,
            Arc::new(MonotonicClock::new()),
            true,
        ));
        (HotplugService::start(governor).unwrap(), cpus)
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "delay_ms = 50\nmin_cpus = 2\n\n[[thresholds]]\nup_queue = 40\nup_stable_ms = 100\ndown_queue = 0\ndown_stable_ms = 0"
        )
        .unwrap();

        let tunables = Tunables::new(4).unwrap();
        load_config(file.path(), &tunables).unwrap();
        assert_eq!(tunables.delay_ms(), 50);
        assert_eq!(tunables.min_cores(), 2);
        assert_eq!(tunables.max_cores(), 4);
        assert_eq!(tunables.bucket(0).up_queue, 40);
        assert_eq!(tunables.start_delay_ms(), 20_000);
    }

    #[test]
    fn test_invalid_config_leaves_tunables_alone() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "delay_ms = 50\nmin_cpus = 9").unwrap();

        let tunables = Tunables::new(4).unwrap();
        let err = load_config(file.path(), &tunables).unwrap_err();
        assert!(format!("{err:#}").contains("applying"));
        assert_eq!(tunables.delay_ms(), 100);
    }

    #[test]
    fn test_get_set_and_stats() {
        let (service, cpus) = simulated_service(2);
        assert_eq!(run(&service, &cpus, "get delay"), "100\n");
        assert_eq!(run(&service, &cpus, "set delay 50"), "ok\n");
        assert_eq!(run(&service, &cpus, "get delay"), "50\n");
        assert_eq!(run(&service, &cpus, "get enabled"), "1\n");

        let stats = run(&service, &cpus, "stats");
        assert!(stats.starts_with("time_cpus_on:\n0 "));
        assert!(stats.contains("times_cpus_unplugged:\n0 0\n1 0"));
        assert!(run(&service, &cpus, "stats json").contains("\"cores\""));
    }

    #[test]
    fn test_disable_and_enable_reply() {
        let (service, cpus) = simulated_service(3);
        cpus.set_online(2, false);
        assert_eq!(run(&service, &cpus, "disable"), "disabled\n");
        assert_eq!(cpus.online_count(), 3);
        assert_eq!(run(&service, &cpus, "disable"), "already disabled\n");
        assert_eq!(run(&service, &cpus, "enable"), "enabled\n");
    }

    #[test]
    fn test_suspend_and_resume() {
        let (service, cpus) = simulated_service(4);
        run(&service, &cpus, "suspend");
        assert_eq!(cpus.online_mask(), vec![true, false, false, false]);
        run(&service, &cpus, "resume");
        assert_eq!(cpus.online_mask(), vec![true; 4]);
    }

    #[test]
    fn test_simulation_controls() {
        let (service, cpus) = simulated_service(2);
        run(&service, &cpus, "load 45");
        run(&service, &cpus, "freq 1 300000");
        assert_eq!(cpus.read_queue_depth(), 45);
        assert_eq!(cpus.read_core_clock_rate(1), 300_000);

        let mut out = Vec::new();
        let err = execute(&service, None, Command::Load(10), &mut out).unwrap_err();
        assert!(err.to_string().contains("--simulate"));
        let err = execute(&service, Some(&*cpus), Command::Freq(7, 1), &mut out).unwrap_err();
        assert!(err.to_string().contains("no core 7"));
    }

    #[test]
    fn test_zero_simulated_cores_rejected() {
        assert!(Platform::simulated(0).is_err());
    }
}
