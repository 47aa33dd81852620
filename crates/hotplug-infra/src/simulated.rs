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


//! In-memory cores for dry runs and tests.

use hotplug_core::{ActuatorError, CoreActuator, CoreId, CoreTelemetry};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy)]
struct SimulatedCore {
    online: bool,
    clock_khz: u64,
    refusing: bool,
}

/// A fake machine whose load, clock rates and online state are set by hand.
///
/// Offline cores report a clock rate of zero, like an unreadable cpufreq node.
#[derive(Debug)]
pub struct SimulatedCpus {
    cores: Mutex<Vec<SimulatedCore>>,
    queue_depth: AtomicU32,
    transitions: AtomicUsize,
}

impl SimulatedCpus {
    /// `cores` cores, all online at `clock_khz`.
    pub fn new(cores: usize, clock_khz: u64) -> Self {
        let core = SimulatedCore {
            online: true,
            clock_khz,
            refusing: false,
        };
        Self {
            cores: Mutex::new(vec![core; cores]),
            queue_depth: AtomicU32::new(0),
            transitions: AtomicUsize::new(0),
        }
    }

    fn cores(&self) -> MutexGuard<'_, Vec<SimulatedCore>> {
        self.cores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of simulated cores.
    pub fn core_count(&self) -> usize {
        self.cores().len()
    }

    /// Sets the reported run-queue depth (tenths of a task).
    pub fn set_queue_depth(&self, depth: u32) {
        self.queue_depth.store(depth, Ordering::SeqCst);
    }

    /// Sets the clock rate `core` reports while online.
    pub fn set_clock_rate(&self, core: CoreId, khz: u64) {
        if let Some(c) = self.cores().get_mut(core) {
            c.clock_khz = khz;
        }
    }

    /// Flips `core` behind the governor's back. Not counted as a transition.
    pub fn set_online(&self, core: CoreId, online: bool) {
        if let Some(c) = self.cores().get_mut(core) {
            c.online = online;
        }
    }

    /// Makes every transition request for `core` fail with a refusal.
    pub fn set_refusing(&self, core: CoreId, refusing: bool) {
        if let Some(c) = self.cores().get_mut(core) {
            c.refusing = refusing;
        }
    }

    /// Online state of every core, core 0 first.
    pub fn online_mask(&self) -> Vec<bool> {
        self.cores().iter().map(|c| c.online).collect()
    }

    /// Number of online cores.
    pub fn online_count(&self) -> usize {
        self.cores().iter().filter(|c| c.online).count()
    }

    /// Number of transition requests received, failed ones included.
    pub fn transition_calls(&self) -> usize {
        self.transitions.load(Ordering::SeqCst)
    }

    fn transition(&self, core: CoreId, online: bool) -> Result<(), ActuatorError> {
        self.transitions.fetch_add(1, Ordering::SeqCst);
        let mut cores = self.cores();
        let Some(c) = cores.get_mut(core) else {
            return Err(ActuatorError::Refused {
                core,
                reason: "no such core".into(),
            });
        };
        if c.refusing {
            return Err(ActuatorError::Refused {
                core,
                reason: "simulated refusal".into(),
            });
        }
        if c.online == online {
            return Err(ActuatorError::AlreadyInState { core, online });
        }
        c.online = online;
        log::debug!("Simulated CPU[{}] online={}", core, online);
        Ok(())
    }
}

impl CoreTelemetry for SimulatedCpus {
    fn read_queue_depth(&self) -> u32 {
        self.queue_depth.load(Ordering::SeqCst)
    }

    fn read_core_clock_rate(&self, core: CoreId) -> u64 {
        self.cores()
            .get(core)
            .filter(|c| c.online)
            .map_or(0, |c| c.clock_khz)
    }
}

impl CoreActuator for SimulatedCpus {
    fn bring_core_online(&self, core: CoreId) -> Result<(), ActuatorError> {
        self.transition(core, true)
    }

    fn bring_core_offline(&self, core: CoreId) -> Result<(), ActuatorError> {
        self.transition(core, false)
    }

    fn is_core_online(&self, core: CoreId) -> bool {
        self.cores().get(core).is_some_and(|c| c.online)
    }
}
