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


//! Read-only statistics surface.

use crate::cores::CoreStats;
use hotplug_core::Decision;
use serde::Serialize;
use std::fmt::Write;

/// Point-in-time view of the governor and every core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    /// Whether the governor is switched on.
    pub enabled: bool,
    /// Last decision.
    pub mode: Decision,
    /// End of the current or most recent backoff (ms).
    pub paused_until_ms: u64,
    /// Per-core statistics, core 0 first.
    pub cores: Vec<CoreStats>,
}

impl StatsReport {
    /// `"<core> <total online ms>"` per line.
    pub fn time_cpus_on(&self) -> String {
        self.per_core(|stats| stats.total_online_ms)
    }

    /// `"<core> <offline → online transitions>"` per line.
    pub fn times_cpus_hotplugged(&self) -> String {
        self.per_core(|stats| stats.hotplug_count)
    }

    /// `"<core> <online → offline transitions>"` per line.
    pub fn times_cpus_unplugged(&self) -> String {
        self.per_core(|stats| stats.unplug_count)
    }

    /// Serialises the whole report.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn per_core(&self, value: impl Fn(&CoreStats) -> u64) -> String {
        let mut out = String::new();
        for stats in &self.cores {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{} {}", stats.core, value(stats));
        }
        out
    }
}
