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

//! # Hotplug Infra
//!
//! Concrete implementations of the platform traits defined in `hotplug-core`:
//! a Linux backend over sysfs and procfs, and an in-memory simulation used by
//! the daemon's dry-run mode and by tests.

pub mod simulated;
pub mod sysfs;

pub use simulated::SimulatedCpus;
pub use sysfs::{highest_cpu_in_list, SysfsCpus};
