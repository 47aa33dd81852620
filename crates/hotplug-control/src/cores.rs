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


//! Per-core bookkeeping.
//!
//! Each core owns its own lock, so reading one core's statistics never waits on
//! a transition of another core. Transitions of a single core are totally
//! ordered by that lock.

use hotplug_core::{ActuatorError, CoreActuator, CoreId};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What the governor believes about one core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreRecord {
    /// Believed online state. Reconciled against the platform when stale.
    pub online: bool,
    /// Forced offline by a display suspend.
    pub suspended: bool,
    /// Start of the current online span (ms). Meaningless while offline.
    pub online_since: u64,
    /// Sum of all completed online spans (ms).
    pub cumulative_online_ms: u64,
    /// Number of offline → online transitions.
    pub hotplug_count: u64,
    /// Number of online → offline transitions.
    pub unplug_count: u64,
}

impl CoreRecord {
    fn starting(online: bool, now: u64) -> Self {
        Self {
            online,
            online_since: now,
            ..Self::default()
        }
    }

    /// Total time spent online, including the span in progress.
    pub fn total_online_ms(&self, now: u64) -> u64 {
        let current = if self.online {
            now.saturating_sub(self.online_since)
        } else {
            0
        };
        self.cumulative_online_ms + current
    }

    /// Closes the current span, if any, and returns its length.
    fn close_span(&mut self, now: u64) -> u64 {
        if !self.online {
            return 0;
        }
        let span = now.saturating_sub(self.online_since);
        self.cumulative_online_ms += span;
        self.online = false;
        span
    }

    fn open_span(&mut self, now: u64) {
        self.online = true;
        self.online_since = now;
    }
}

/// Read-only view of one core, as exposed to front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    /// Core index.
    pub core: CoreId,
    /// Believed online state.
    pub online: bool,
    /// Forced offline by a display suspend.
    pub suspended: bool,
    /// Total online time including the current span (ms).
    pub total_online_ms: u64,
    /// Lifetime offline → online transitions.
    pub hotplug_count: u64,
    /// Lifetime online → offline transitions.
    pub unplug_count: u64,
}

/// Fixed-size arena of independently locked core records.
#[derive(Debug)]
pub struct CoreTable {
    records: Box<[Mutex<CoreRecord>]>,
}

impl CoreTable {
    /// Creates one record per core, seeded from the platform's view.
    pub fn new(cores: usize, actuator: &dyn CoreActuator, now: u64) -> Self {
        let records = (0..cores)
            .map(|core| Mutex::new(CoreRecord::starting(actuator.is_core_online(core), now)))
            .collect();
        Self { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the table has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lock(&self, core: CoreId) -> Option<MutexGuard<'_, CoreRecord>> {
        self.records
            .get(core)
            .map(|record| record.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn lock_known(&self, core: CoreId) -> Result<MutexGuard<'_, CoreRecord>, ActuatorError> {
        self.lock(core).ok_or_else(|| ActuatorError::Refused {
            core,
            reason: format!("no such core ({} known)", self.len()),
        })
    }

    /// Copy of the record of `core`.
    pub fn record(&self, core: CoreId) -> Option<CoreRecord> {
        self.lock(core).map(|record| *record)
    }

    /// Takes `core` offline and folds its online span into the totals.
    ///
    /// The record is left untouched if the platform rejects the request.
    pub fn bring_offline(
        &self,
        core: CoreId,
        actuator: &dyn CoreActuator,
        now: u64,
    ) -> Result<(), ActuatorError> {
        let mut record = self.lock_known(core)?;
        actuator.bring_core_offline(core)?;
        let span = record.close_span(now);
        record.unplug_count += 1;
        log::info!("CPU[{}] on->off | time online: {}ms", core, span);
        Ok(())
    }

    /// Brings `core` online and starts a new online span.
    pub fn bring_online(
        &self,
        core: CoreId,
        actuator: &dyn CoreActuator,
        now: u64,
    ) -> Result<(), ActuatorError> {
        let mut record = self.lock_known(core)?;
        actuator.bring_core_online(core)?;
        record.close_span(now);
        record.open_span(now);
        record.hotplug_count += 1;
        log::info!("CPU[{}] off->on", core);
        Ok(())
    }

    /// Re-reads every core's online state from the platform.
    ///
    /// Spans are opened or closed to match; transition counters are left alone
    /// because the change did not go through the governor. Returns the number of
    /// records that were corrected.
    pub fn reconcile(&self, actuator: &dyn CoreActuator, now: u64) -> usize {
        let mut corrected = 0;
        for core in 0..self.len() {
            let Some(mut record) = self.lock(core) else {
                continue;
            };
            let online = actuator.is_core_online(core);
            if record.online == online {
                continue;
            }
            if online {
                record.open_span(now);
            } else {
                record.close_span(now);
            }
            corrected += 1;
            log::debug!("CPU[{}] reconciled to online={}", core, online);
        }
        corrected
    }

    /// Sets the suspension flag of `core`. Unknown cores are ignored.
    pub fn set_suspended(&self, core: CoreId, suspended: bool) {
        if let Some(mut record) = self.lock(core) {
            record.suspended = suspended;
        }
    }

    /// Returns true if any core is held offline by a display suspend.
    pub fn any_suspended(&self) -> bool {
        (0..self.len()).any(|core| self.lock(core).is_some_and(|record| record.suspended))
    }

    /// Statistics of `core` at `now`.
    pub fn stats(&self, core: CoreId, now: u64) -> Option<CoreStats> {
        let record = self.record(core)?;
        Some(CoreStats {
            core,
            online: record.online,
            suspended: record.suspended,
            total_online_ms: record.total_online_ms(now),
            hotplug_count: record.hotplug_count,
            unplug_count: record.unplug_count,
        })
    }

    /// Statistics of every core at `now`.
    pub fn all_stats(&self, now: u64) -> Vec<CoreStats> {
        (0..self.len())
            .filter_map(|core| self.stats(core, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Single flippable core plus an always-online primary.
    struct Toggle {
        online: AtomicBool,
        refuse: AtomicBool,
    }

    impl Toggle {
        fn new(online: bool) -> Self {
            Self {
                online: AtomicBool::new(online),
                refuse: AtomicBool::new(false),
            }
        }

        fn set(&self, core: CoreId, online: bool) -> Result<(), ActuatorError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ActuatorError::Refused {
                    core,
                    reason: "test".into(),
                });
            }
            if self.online.swap(online, Ordering::SeqCst) == online {
                return Err(ActuatorError::AlreadyInState { core, online });
            }
            Ok(())
        }
    }

    impl CoreActuator for Toggle {
        fn bring_core_online(&self, core: CoreId) -> Result<(), ActuatorError> {
            self.set(core, true)
        }
        fn bring_core_offline(&self, core: CoreId) -> Result<(), ActuatorError> {
            self.set(core, false)
        }
        fn is_core_online(&self, core: CoreId) -> bool {
            core == 0 || self.online.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_seeded_from_platform() {
        let table = CoreTable::new(2, &Toggle::new(false), 0);
        assert!(table.record(0).unwrap().online);
        assert!(!table.record(1).unwrap().online);
        assert!(table.record(2).is_none());
    }

    #[test]
    fn test_cumulative_time_sums_all_spans() {
        let toggle = Toggle::new(true);
        let table = CoreTable::new(2, &toggle, 0);

        table.bring_offline(1, &toggle, 100).unwrap();
        table.bring_online(1, &toggle, 400).unwrap();
        table.bring_offline(1, &toggle, 450).unwrap();
        table.bring_online(1, &toggle, 1_000).unwrap();
        table.bring_offline(1, &toggle, 1_025).unwrap();

        let record = table.record(1).unwrap();
        assert_eq!(record.cumulative_online_ms, 100 + 50 + 25);
        assert_eq!(record.total_online_ms(5_000), 175);
        assert_eq!(record.unplug_count, 3);
        assert_eq!(record.hotplug_count, 2);
    }

    #[test]
    fn test_total_includes_running_span() {
        let toggle = Toggle::new(false);
        let table = CoreTable::new(2, &toggle, 0);
        table.bring_online(1, &toggle, 200).unwrap();
        let stats = table.stats(1, 350).unwrap();
        assert_eq!(stats.total_online_ms, 150);
        assert_eq!(stats.hotplug_count, 1);
    }

    #[test]
    fn test_failed_transition_leaves_record_alone() {
        let toggle = Toggle::new(true);
        let table = CoreTable::new(2, &toggle, 0);
        toggle.refuse.store(true, Ordering::SeqCst);
        assert!(table.bring_offline(1, &toggle, 10).is_err());
        let record = table.record(1).unwrap();
        assert!(record.online);
        assert_eq!(record.unplug_count, 0);
    }

    #[test]
    fn test_reconcile_fixes_stale_records_without_counting() {
        let toggle = Toggle::new(true);
        let table = CoreTable::new(2, &toggle, 0);
        toggle.online.store(false, Ordering::SeqCst);

        assert_eq!(table.reconcile(&toggle, 300), 1);
        let record = table.record(1).unwrap();
        assert!(!record.online);
        assert_eq!(record.cumulative_online_ms, 300);
        assert_eq!(record.unplug_count, 0);

        assert_eq!(table.reconcile(&toggle, 400), 0);
    }

    #[test]
    fn test_unknown_core_is_refused_without_platform_call() {
        let toggle = Toggle::new(true);
        let table = CoreTable::new(2, &toggle, 0);
        assert!(matches!(
            table.bring_offline(5, &toggle, 10),
            Err(ActuatorError::Refused { core: 5, .. })
        ));
        assert!(matches!(
            table.bring_online(5, &toggle, 10),
            Err(ActuatorError::Refused { core: 5, .. })
        ));
        assert!(toggle.online.load(Ordering::SeqCst), "platform untouched");

        table.set_suspended(5, true);
        assert!(!table.any_suspended());
        assert!(table.stats(5, 10).is_none());
    }

    #[test]
    fn test_suspension_flags() {
        let table = CoreTable::new(3, &Toggle::new(true), 0);
        assert!(!table.any_suspended());
        table.set_suspended(2, true);
        assert!(table.any_suspended());
        table.set_suspended(2, false);
        assert!(!table.any_suspended());
    }
}
