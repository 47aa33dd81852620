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

//! # Hotplug Control
//!
//! The decision side of the governor: tunables, the per-core state table, the
//! hysteresis decision engine, the [`Governor`] that applies decisions, and the
//! [`HotplugService`] that drives it from a background thread and coordinates
//! display suspend/resume.

pub mod analysis;
pub mod config;
pub mod cores;
pub mod governor;
pub mod service;
pub mod stats;

pub use analysis::{DecisionEngine, EngineState};
pub use config::{BucketThresholds, ConfigError, Tunables, TunablesSnapshot};
pub use cores::{CoreRecord, CoreStats, CoreTable};
pub use governor::{Governor, TickOutcome, TickReport};
pub use service::{HotplugService, ServiceError};
pub use stats::StatsReport;
