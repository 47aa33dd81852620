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


//! The governor: applies engine decisions to the platform.
//!
//! A [`Governor`] owns the engine state and the per-core table and serialises
//! every transition behind a single transition lock. The periodic tick only
//! ever *tries* that lock and skips on contention, so the cadence never stalls;
//! suspend, resume, enable and disable take it blocking.
//!
//! Lock order is transition lock, then engine state, then a core record.

use crate::analysis::{DecisionEngine, EngineState};
use crate::config::Tunables;
use crate::cores::CoreTable;
use crate::stats::StatsReport;
use hotplug_core::{
    ActuatorError, Clock, CoreActuator, CoreId, CoreTelemetry, Decision, PRIMARY_CORE,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Still inside the start-up grace period.
    Warmup,
    /// A backoff is in effect.
    Paused,
    /// At least one core is held offline by a display suspend.
    Suspended,
    /// Another transition held the lock.
    Contended,
    /// The engine ran and its decision was applied (or needed no action).
    Decided(Decision),
    /// The transition of this core failed and a backoff started.
    Backoff(CoreId),
}

/// Result of a tick, including when the loop should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// What happened.
    pub outcome: TickOutcome,
    /// Delay before the next tick, `None` once the governor is disabled.
    pub rearm_after: Option<Duration>,
}

/// Hotplug governor for one machine.
pub struct Governor {
    tunables: Arc<Tunables>,
    cores: CoreTable,
    state: Mutex<EngineState>,
    transition: Mutex<()>,
    engine: DecisionEngine,
    telemetry: Arc<dyn CoreTelemetry>,
    actuator: Arc<dyn CoreActuator>,
    clock: Arc<dyn Clock>,
}

impl Governor {
    /// Creates a governor over `tunables.cores()` cores.
    pub fn new(
        tunables: Arc<Tunables>,
        telemetry: Arc<dyn CoreTelemetry>,
        actuator: Arc<dyn CoreActuator>,
        clock: Arc<dyn Clock>,
        enabled: bool,
    ) -> Self {
        let cores = CoreTable::new(tunables.cores(), actuator.as_ref(), clock.now_ms());
        Self {
            tunables,
            cores,
            state: Mutex::new(EngineState::new(enabled)),
            transition: Mutex::new(()),
            engine: DecisionEngine,
            telemetry,
            actuator,
            clock,
        }
    }

    /// Live tunables.
    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    /// Per-core table.
    pub fn cores(&self) -> &CoreTable {
        &self.cores
    }

    /// Copy of the engine state.
    pub fn engine_state(&self) -> EngineState {
        self.state().clone()
    }

    /// Returns true unless the governor is switched off.
    pub fn is_enabled(&self) -> bool {
        self.state().mode.is_enabled()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_transitions(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one control loop iteration.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now_ms();
        let outcome = self.run_tick(now);
        let rearm_after = self
            .is_enabled()
            .then(|| Duration::from_millis(self.tunables.delay_ms()));
        TickReport {
            outcome,
            rearm_after,
        }
    }

    fn run_tick(&self, now: u64) -> TickOutcome {
        if now <= self.tunables.start_delay_ms() {
            return TickOutcome::Warmup;
        }
        if self.state().is_paused(now) {
            return TickOutcome::Paused;
        }
        if self.cores.any_suspended() {
            return TickOutcome::Suspended;
        }

        let _transition = match self.transition.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::trace!("Transition in flight, skipping tick.");
                return TickOutcome::Contended;
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let mut state = self.state();
        if state.needs_reconcile {
            let corrected = self.cores.reconcile(self.actuator.as_ref(), now);
            if corrected > 0 {
                log::info!("Reconciled {} core record(s) with the platform.", corrected);
            }
            state.needs_reconcile = false;
        }

        let decision = self.engine.decide(
            now,
            &self.tunables,
            self.telemetry.as_ref(),
            self.actuator.as_ref(),
            &mut state,
        );
        state.mode = decision;

        let result = match decision {
            Decision::Disabled | Decision::Idle => return TickOutcome::Decided(decision),
            Decision::Down => self.down_candidate().map(|core| {
                (
                    core,
                    self.cores.bring_offline(core, self.actuator.as_ref(), now),
                )
            }),
            Decision::Up => self.up_candidate().map(|core| {
                (
                    core,
                    self.cores.bring_online(core, self.actuator.as_ref(), now),
                )
            }),
        };

        match result {
            Some((core, Err(err))) => {
                self.pause(&mut state, now, &err);
                TickOutcome::Backoff(core)
            }
            _ => TickOutcome::Decided(decision),
        }
    }

    /// Online non-primary core with the lowest clock rate, lowest index first.
    pub fn down_candidate(&self) -> Option<CoreId> {
        (0..self.cores.len())
            .filter(|&core| core != PRIMARY_CORE && self.actuator.is_core_online(core))
            .min_by_key(|&core| (self.telemetry.read_core_clock_rate(core), core))
    }

    /// Lowest-indexed offline core.
    pub fn up_candidate(&self) -> Option<CoreId> {
        (0..self.cores.len())
            .find(|&core| core != PRIMARY_CORE && !self.actuator.is_core_online(core))
    }

    fn pause(&self, state: &mut EngineState, now: u64, err: &ActuatorError) {
        let pause = self.tunables.pause_ms();
        log::warn!(
            "CPU[{}] bypassed the governor ({}) | pausing {}ms",
            err.core(),
            err,
            pause
        );
        state.paused_until = now.saturating_add(pause);
        state.needs_reconcile = true;
    }

    /// Returns true if display-off should force single-core mode.
    pub fn single_core_on_suspend(&self) -> bool {
        self.tunables.scroff_single_core()
    }

    /// Forces every non-primary core offline and marks it suspended.
    ///
    /// The caller must have halted the control loop first.
    pub fn suspend_cores(&self) {
        let _transition = self.lock_transitions();
        let now = self.clock.now_ms();
        for core in (0..self.cores.len()).filter(|&c| c != PRIMARY_CORE) {
            self.force(core, false, now);
            self.cores.set_suspended(core, true);
        }
    }

    /// Returns true if a resume has work to do: either the single-core policy
    /// is on, or cores are still held from an earlier suspend.
    pub fn resume_required(&self) -> bool {
        self.single_core_on_suspend() || self.cores.any_suspended()
    }

    /// Forces every non-primary core online and clears its suspension.
    pub fn resume_cores(&self) {
        let _transition = self.lock_transitions();
        let now = self.clock.now_ms();
        for core in (0..self.cores.len()).filter(|&c| c != PRIMARY_CORE) {
            self.force(core, true, now);
            self.cores.set_suspended(core, false);
        }
        self.state().needs_reconcile = true;
    }

    /// Switches the governor off and brings every non-primary core online.
    ///
    /// The caller must have halted the control loop first. Returns false if
    /// the governor was already off.
    pub fn disable(&self) -> bool {
        let _transition = self.lock_transitions();
        {
            let mut state = self.state();
            if !state.mode.is_enabled() {
                return false;
            }
            state.mode = Decision::Disabled;
        }
        let now = self.clock.now_ms();
        for core in (0..self.cores.len()).filter(|&c| c != PRIMARY_CORE) {
            self.force(core, true, now);
        }
        log::info!("Hotplug governor disabled.");
        true
    }

    /// Switches the governor back on. Returns false if it was already on.
    pub fn enable(&self) -> bool {
        let _transition = self.lock_transitions();
        let mut state = self.state();
        if state.mode.is_enabled() {
            return false;
        }
        state.mode = Decision::Idle;
        state.needs_reconcile = true;
        log::info!("Hotplug governor enabled.");
        true
    }

    fn force(&self, core: CoreId, online: bool, now: u64) {
        let result = if online {
            self.cores.bring_online(core, self.actuator.as_ref(), now)
        } else {
            self.cores.bring_offline(core, self.actuator.as_ref(), now)
        };
        match result {
            Ok(()) | Err(ActuatorError::AlreadyInState { .. }) => {}
            Err(err) => log::warn!("Could not force CPU[{}] online={}: {}", core, online, err),
        }
    }

    /// Current statistics of every core.
    pub fn stats(&self) -> StatsReport {
        let now = self.clock.now_ms();
        let state = self.engine_state();
        StatsReport {
            enabled: state.mode.is_enabled(),
            mode: state.mode,
            paused_until_ms: state.paused_until,
            cores: self.cores.all_stats(now),
        }
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("cores", &self.cores.len())
            .field("state", &self.engine_state())
            .finish()
    }
}
