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


//! Hysteresis decision engine.
//!
//! The `DecisionEngine` looks at the run-queue depth, the number of online cores
//! and the slowest online clock rate, and decides whether one core should be
//! added or removed. A direction only wins once the load has pointed that way
//! for the bucket's stable time; time spent in the dead zone between the up and
//! down triggers restarts the count.

use crate::config::Tunables;
use hotplug_core::{CoreActuator, CoreId, CoreTelemetry, Decision, PRIMARY_CORE};

/// Mutable state of the governor between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    /// Last decision, or `Disabled` while switched off.
    pub mode: Decision,
    /// No decision is taken while `now < paused_until`.
    pub paused_until: u64,
    /// Time the load has consistently pointed in one direction (ms).
    pub accumulated_stable_ms: u64,
    /// Time of the previous evaluated tick, `None` before the first one.
    pub last_tick: Option<u64>,
    /// The core records must be re-read from the platform before the next
    /// decision.
    pub needs_reconcile: bool,
}

impl EngineState {
    /// Fresh state, enabled or switched off.
    pub fn new(enabled: bool) -> Self {
        Self {
            mode: if enabled {
                Decision::Idle
            } else {
                Decision::Disabled
            },
            paused_until: 0,
            accumulated_stable_ms: 0,
            last_tick: None,
            needs_reconcile: true,
        }
    }

    /// Returns true while a backoff is in effect.
    pub fn is_paused(&self, now: u64) -> bool {
        now < self.paused_until
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Maps load signals and tunables to a [`Decision`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    /// Evaluates one tick.
    ///
    /// Only `state.accumulated_stable_ms` and `state.last_tick` are updated;
    /// recording the result as the new mode is left to the caller.
    pub fn decide(
        &self,
        now: u64,
        tunables: &Tunables,
        telemetry: &dyn CoreTelemetry,
        actuator: &dyn CoreActuator,
        state: &mut EngineState,
    ) -> Decision {
        if state.mode == Decision::Disabled {
            return Decision::Disabled;
        }
        if now <= tunables.start_delay_ms() {
            return Decision::Idle;
        }

        let cores = tunables.cores();
        let min = tunables.min_cores();
        let max = tunables.max_cores();
        // No headroom left to scale in either direction.
        if min == cores && max == cores {
            return Decision::Idle;
        }

        if let Some(last) = state.last_tick {
            state.accumulated_stable_ms = state
                .accumulated_stable_ms
                .saturating_add(now.saturating_sub(last));
        }

        let rq_depth = telemetry.read_queue_depth();
        let online: Vec<CoreId> = (0..cores).filter(|&c| actuator.is_core_online(c)).collect();
        let nr_online = online.len();

        let decision = if nr_online == 0 {
            state.accumulated_stable_ms = 0;
            Decision::Idle
        } else {
            let thresholds = tunables.bucket(nr_online - 1);
            if nr_online < max && rq_depth >= thresholds.up_queue {
                if state.accumulated_stable_ms >= thresholds.up_stable_ms {
                    // Still idling at the floor: the queue alone does not justify a core.
                    if slowest_online_rate(telemetry, &online) <= tunables.idle_freq() {
                        Decision::Idle
                    } else {
                        Decision::Up
                    }
                } else {
                    Decision::Idle
                }
            } else if nr_online > min && rq_depth <= thresholds.down_queue {
                if state.accumulated_stable_ms >= thresholds.down_stable_ms {
                    if slowest_online_rate(telemetry, &online) > tunables.idle_freq() {
                        Decision::Idle
                    } else {
                        Decision::Down
                    }
                } else {
                    Decision::Idle
                }
            } else {
                state.accumulated_stable_ms = 0;
                Decision::Idle
            }
        };

        if decision != Decision::Idle {
            state.accumulated_stable_ms = 0;
        }
        state.last_tick = Some(now);

        log::debug!(
            "rq: {}, online: {}, stable: {}ms, decision: {:?}",
            rq_depth,
            nr_online,
            state.accumulated_stable_ms,
            decision
        );
        decision
    }
}

/// Lowest clock rate among `online` cores; the primary core always counts.
pub fn slowest_online_rate(telemetry: &dyn CoreTelemetry, online: &[CoreId]) -> u64 {
    online
        .iter()
        .copied()
        .filter(|&core| core != PRIMARY_CORE)
        .map(|core| telemetry.read_core_clock_rate(core))
        .fold(telemetry.read_core_clock_rate(PRIMARY_CORE), u64::min)
}
