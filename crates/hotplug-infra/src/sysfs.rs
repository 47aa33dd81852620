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


//! Linux backend over `/sys/devices/system/cpu` and `/proc/stat`.
//!
//! Run-queue depth comes from the `procs_running` line of `/proc/stat`, clock
//! rates from `cpufreq/scaling_cur_freq`, and transitions are writes of `0` or
//! `1` to `cpuN/online`. Cores without an `online` switch (usually core 0)
//! count as permanently online.

use anyhow::{anyhow, bail, Context, Result};
use hotplug_core::{ActuatorError, CoreActuator, CoreId, CoreTelemetry};
use std::fs;
use std::path::PathBuf;
use sysinfo::System;

/// Default sysfs directory holding one `cpuN` entry per core.
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
/// Default kernel statistics file.
pub const PROC_STAT: &str = "/proc/stat";

/// Largest core count accepted from the `possible` list, the kernel's own
/// `NR_CPUS` ceiling.
pub const MAX_CORES: usize = 8192;

/// Queue depths are reported in tenths of a task.
const QUEUE_DEPTH_SCALE: u32 = 10;

/// Cores of the running machine, seen through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsCpus {
    root: PathBuf,
    proc_stat: PathBuf,
}

impl SysfsCpus {
    /// Backend over a custom sysfs root and stat file.
    pub fn new(root: impl Into<PathBuf>, proc_stat: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            proc_stat: proc_stat.into(),
        }
    }

    fn core_dir(&self, core: CoreId) -> PathBuf {
        self.root.join(format!("cpu{core}"))
    }

    /// Number of possible cores.
    ///
    /// Reads the `possible` list; falls back to the cores `sysinfo` can see.
    pub fn possible_cores(&self) -> Result<usize> {
        let path = self.root.join("possible");
        match fs::read_to_string(&path) {
            Ok(text) => {
                let highest = highest_cpu_in_list(text.trim())
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(highest + 1)
            }
            Err(e) => {
                log::warn!(
                    "Could not read {} ({}), asking sysinfo instead.",
                    path.display(),
                    e
                );
                let mut system = System::new();
                system.refresh_cpu_all();
                let count = system.cpus().len();
                if count == 0 {
                    bail!("could not determine the number of cores");
                }
                Ok(count)
            }
        }
    }

    fn read_procs_running(&self) -> Result<u32> {
        let text = fs::read_to_string(&self.proc_stat)
            .with_context(|| format!("Failed to read {}", self.proc_stat.display()))?;
        let line = text
            .lines()
            .find_map(|line| line.strip_prefix("procs_running"))
            .ok_or_else(|| anyhow!("no procs_running line in {}", self.proc_stat.display()))?;
        line.trim()
            .parse::<u32>()
            .context("Failed to parse procs_running")
    }

    fn write_online(&self, core: CoreId, online: bool) -> Result<(), ActuatorError> {
        if self.is_core_online(core) == online {
            return Err(ActuatorError::AlreadyInState { core, online });
        }
        let path = self.core_dir(core).join("online");
        fs::write(&path, if online { "1" } else { "0" }).map_err(|e| ActuatorError::Refused {
            core,
            reason: format!("{}: {}", path.display(), e),
        })
    }
}

impl CoreTelemetry for SysfsCpus {
    fn read_queue_depth(&self) -> u32 {
        match self.read_procs_running() {
            // procs_running counts the reading thread itself.
            Ok(running) => running.saturating_sub(1).saturating_mul(QUEUE_DEPTH_SCALE),
            Err(e) => {
                log::debug!("Run-queue depth unavailable: {:#}", e);
                0
            }
        }
    }

    fn read_core_clock_rate(&self, core: CoreId) -> u64 {
        let path = self.core_dir(core).join("cpufreq/scaling_cur_freq");
        fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }
}

impl CoreActuator for SysfsCpus {
    fn bring_core_online(&self, core: CoreId) -> Result<(), ActuatorError> {
        self.write_online(core, true)
    }

    fn bring_core_offline(&self, core: CoreId) -> Result<(), ActuatorError> {
        self.write_online(core, false)
    }

    fn is_core_online(&self, core: CoreId) -> bool {
        let dir = self.core_dir(core);
        match fs::read_to_string(dir.join("online")) {
            Ok(text) => text.trim() == "1",
            // No hotplug switch: the core cannot be taken down.
            Err(_) => dir.is_dir(),
        }
    }
}

/// Highest core index in a kernel CPU list such as `0-3,6,8-9`.
///
/// Indices at or above [`MAX_CORES`] are rejected.
pub fn highest_cpu_in_list(text: &str) -> Result<CoreId> {
    let mut highest = None;
    for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let last: CoreId = match part.split_once('-') {
            Some((start, end)) => {
                let start: CoreId = start.trim().parse()?;
                let end: CoreId = end.trim().parse()?;
                if end < start {
                    bail!("descending CPU range '{}'", part);
                }
                end
            }
            None => part.parse()?,
        };
        if last >= MAX_CORES {
            bail!("core {} is beyond the supported {} cores", last, MAX_CORES);
        }
        highest = highest.max(Some(last));
    }
    highest.ok_or_else(|| anyhow!("empty CPU list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SysfsCpus) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cpu");
        fs::create_dir_all(root.join("cpu0/cpufreq")).unwrap();
        fs::create_dir_all(root.join("cpu1/cpufreq")).unwrap();
        fs::write(root.join("possible"), "0-1\n").unwrap();
        fs::write(root.join("cpu0/cpufreq/scaling_cur_freq"), "1512000\n").unwrap();
        fs::write(root.join("cpu1/cpufreq/scaling_cur_freq"), "384000\n").unwrap();
        fs::write(root.join("cpu1/online"), "1\n").unwrap();
        let stat = dir.path().join("stat");
        fs::write(&stat, "cpu  1 2 3 4\nprocs_running 5\nprocs_blocked 0\n").unwrap();
        let cpus = SysfsCpus::new(root, stat);
        (dir, cpus)
    }

    #[test]
    fn test_highest_cpu_in_list() {
        assert_eq!(highest_cpu_in_list("0-3").unwrap(), 3);
        assert_eq!(highest_cpu_in_list("0,2-3,7").unwrap(), 7);
        assert_eq!(highest_cpu_in_list("8-9,5").unwrap(), 9);
        assert_eq!(highest_cpu_in_list("5").unwrap(), 5);
        assert!(highest_cpu_in_list("").is_err());
        assert!(highest_cpu_in_list("3-1").is_err());
        assert!(highest_cpu_in_list("a-b").is_err());
    }

    #[test]
    fn test_huge_cpu_range_rejected_without_expanding() {
        let err = highest_cpu_in_list("0-4000000000").unwrap_err();
        assert!(err.to_string().contains("beyond the supported"));
        assert_eq!(highest_cpu_in_list("0-8191").unwrap(), 8191);
        assert!(highest_cpu_in_list("8192").is_err());
    }

    #[test]
    fn test_possible_cores_rejects_oversized_list() {
        let (dir, _) = fixture();
        let root = dir.path().join("cpu");
        fs::write(root.join("possible"), "0-4000000000\n").unwrap();
        let cpus = SysfsCpus::new(root, dir.path().join("stat"));
        assert!(cpus.possible_cores().is_err());
    }

    #[test]
    fn test_possible_cores_from_list() {
        let (_dir, cpus) = fixture();
        assert_eq!(cpus.possible_cores().unwrap(), 2);
    }

    #[test]
    fn test_telemetry_reads() {
        let (_dir, cpus) = fixture();
        assert_eq!(cpus.read_queue_depth(), 40);
        assert_eq!(cpus.read_core_clock_rate(0), 1_512_000);
        assert_eq!(cpus.read_core_clock_rate(1), 384_000);
        assert_eq!(cpus.read_core_clock_rate(7), 0);
    }

    #[test]
    fn test_missing_stat_reports_zero_depth() {
        let cpus = SysfsCpus::new("/nonexistent/cpu", "/nonexistent/stat");
        assert_eq!(cpus.read_queue_depth(), 0);
    }

    #[test]
    fn test_online_switching() {
        let (_dir, cpus) = fixture();
        assert!(cpus.is_core_online(0));
        assert!(cpus.is_core_online(1));
        assert!(!cpus.is_core_online(2));

        cpus.bring_core_offline(1).unwrap();
        assert!(!cpus.is_core_online(1));
        assert_eq!(
            cpus.bring_core_offline(1),
            Err(ActuatorError::AlreadyInState {
                core: 1,
                online: false
            })
        );
        cpus.bring_core_online(1).unwrap();
        assert!(cpus.is_core_online(1));
    }

    #[test]
    fn test_missing_core_refuses() {
        let (_dir, cpus) = fixture();
        assert!(matches!(
            cpus.bring_core_online(3),
            Err(ActuatorError::Refused { core: 3, .. })
        ));
    }
}
