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


//! Background service driving the governor.
//!
//! The control loop runs on a dedicated worker thread that sleeps until the
//! next armed deadline. Front-ends talk to the worker through a command
//! channel: arming a tick, cancelling the pending one, or shutting down. The
//! worker handles commands only between ticks, so once a cancel is
//! acknowledged no tick is pending and none is running.

use crate::config::{parse_flag, ConfigError, Tunables};
use crate::governor::Governor;
use crate::stats::StatsReport;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by the hotplug service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The worker thread could not be created.
    #[error("failed to spawn the hotplug worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A tunable write was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

enum Command {
    /// Run a tick after the delay, unless an earlier one is already pending.
    Arm(Duration),
    /// Drop the pending tick and acknowledge.
    Cancel(Sender<()>),
    Shutdown,
}

/// The hotplug service: a governor plus the thread that ticks it.
pub struct HotplugService {
    governor: Arc<Governor>,
    commands: Sender<Command>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HotplugService {
    /// Spawns the worker thread and, if the governor is enabled, arms the
    /// first tick.
    ///
    /// Nothing is left running if the thread cannot be created.
    pub fn start(governor: Arc<Governor>) -> Result<Self, ServiceError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = Arc::clone(&governor);
        let handle = thread::Builder::new()
            .name("hotplug-governor".into())
            .spawn(move || run_worker(worker, rx))?;

        let service = Self {
            governor,
            commands: tx,
            handle: Some(handle),
        };
        if service.governor.is_enabled() {
            service.arm(Duration::from_millis(service.tunables().delay_ms()));
        }
        log::info!(
            "Hotplug service started ({} cores).",
            service.governor.cores().len()
        );
        Ok(service)
    }

    /// The governor driven by this service.
    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    /// Live tunables.
    pub fn tunables(&self) -> &Tunables {
        self.governor.tunables()
    }

    fn arm(&self, delay: Duration) {
        if self.commands.send(Command::Arm(delay)).is_err() {
            log::warn!("Hotplug worker is gone, tick not armed.");
        }
    }

    /// Cancels the pending tick and waits for an in-flight one to finish.
    fn cancel_sync(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.commands.send(Command::Cancel(ack_tx)).is_ok() {
            // An error only means the worker already exited.
            let _ = ack_rx.recv();
        }
    }

    /// Display turned off.
    ///
    /// With single-core mode on, halts the loop and forces every non-primary
    /// core offline. The loop stays halted until [`resume`](Self::resume).
    pub fn suspend(&self) {
        if !self.governor.single_core_on_suspend() {
            log::info!("Screen -> off");
            return;
        }
        self.cancel_sync();
        self.governor.suspend_cores();
        log::info!("Screen -> off. Deactivated hotplug governor.");
    }

    /// Display turned on.
    ///
    /// Brings every non-primary core back online and ticks the loop
    /// immediately.
    pub fn resume(&self) {
        if !self.governor.resume_required() {
            log::info!("Screen -> on");
            return;
        }
        self.governor.resume_cores();
        self.arm(Duration::ZERO);
        log::info!("Screen -> on. Activated hotplug governor.");
    }

    /// Switches the governor on and arms the loop after the start delay.
    /// Returns false if it was already on.
    pub fn enable(&self) -> bool {
        if !self.governor.enable() {
            return false;
        }
        self.arm(Duration::from_millis(self.tunables().start_delay_ms()));
        true
    }

    /// Halts the loop and brings every non-primary core online. Returns false
    /// if the governor was already off.
    pub fn disable(&self) -> bool {
        if !self.governor.is_enabled() {
            return false;
        }
        self.cancel_sync();
        self.governor.disable()
    }

    /// Whether the governor is switched on.
    pub fn is_enabled(&self) -> bool {
        self.governor.is_enabled()
    }

    /// Reads a tunable, or `enabled`, by name.
    pub fn get(&self, key: &str) -> Result<String, ServiceError> {
        if key == "enabled" {
            return Ok(u8::from(self.is_enabled()).to_string());
        }
        Ok(self.tunables().get(key)?)
    }

    /// Writes a tunable, or `enabled`, by name.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ServiceError> {
        if key == "enabled" {
            if parse_flag(key, value)? {
                self.enable();
            } else {
                self.disable();
            }
            return Ok(());
        }
        Ok(self.tunables().set(key, value)?)
    }

    /// Current statistics.
    pub fn stats(&self) -> StatsReport {
        self.governor.stats()
    }

    /// Stops the worker thread. Cores are left as they are.
    pub fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            log::info!("Hotplug service stopped.");
        }
    }
}

impl Drop for HotplugService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(governor: Arc<Governor>, commands: Receiver<Command>) {
    log::info!("Hotplug worker thread started.");
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(at) => commands.recv_deadline(at),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Arm(delay)) => {
                // A deadline past the clock's range never fires.
                if let Some(at) = Instant::now().checked_add(delay) {
                    deadline = Some(deadline.map_or(at, |pending| pending.min(at)));
                }
            }
            Ok(Command::Cancel(ack)) => {
                deadline = None;
                let _ = ack.send(());
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let report = governor.tick();
                log::trace!("Tick: {:?}", report.outcome);
                deadline = report
                    .rearm_after
                    .and_then(|delay| Instant::now().checked_add(delay));
            }
        }
    }
    log::info!("Hotplug worker thread stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_core::{ActuatorError, CoreActuator, CoreId, CoreTelemetry, MonotonicClock};
    use hotplug_infra::SimulatedCpus;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Starts a service ticking every 5ms with no start-up grace period.
    fn start_with<P>(
        platform: Arc<P>,
        cores: usize,
        enabled: bool,
        configure: impl FnOnce(&Tunables),
    ) -> HotplugService
    where
        P: CoreTelemetry + CoreActuator + 'static,
    {
        let tunables = Tunables::new(cores).unwrap();
        tunables.set_start_delay_ms(0);
        tunables.set_delay_ms(5).unwrap();
        configure(&tunables);
        let governor = Governor::new(
            Arc::new(tunables),
            platform.clone(),
            platform,
            Arc::new(MonotonicClock::new()),
            enabled,
        );
        HotplugService::start(Arc::new(governor)).unwrap()
    }

    fn service(cores: usize, enabled: bool) -> (HotplugService, Arc<SimulatedCpus>) {
        let cpus = Arc::new(SimulatedCpus::new(cores, 1_000_000));
        (start_with(cpus.clone(), cores, enabled, |_| {}), cpus)
    }

    fn instant_up(tunables: &Tunables) {
        for bucket in 0..tunables.cores() {
            let mut thresholds = tunables.bucket(bucket);
            thresholds.up_stable_ms = 0;
            tunables.set_bucket(bucket, thresholds).unwrap();
        }
    }

    /// Polls `condition` for up to two seconds; returns how long it took.
    fn wait_for(mut condition: impl FnMut() -> bool) -> Option<Duration> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if condition() {
                return Some(start.elapsed());
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    /// Simulated cores whose power-up takes a while.
    struct SlowUp {
        cpus: SimulatedCpus,
        started: AtomicBool,
        finished: AtomicBool,
    }

    impl CoreTelemetry for SlowUp {
        fn read_queue_depth(&self) -> u32 {
            self.cpus.read_queue_depth()
        }
        fn read_core_clock_rate(&self, core: CoreId) -> u64 {
            self.cpus.read_core_clock_rate(core)
        }
    }

    impl CoreActuator for SlowUp {
        fn bring_core_online(&self, core: CoreId) -> Result<(), ActuatorError> {
            self.started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            let result = self.cpus.bring_core_online(core);
            self.finished.store(true, Ordering::SeqCst);
            result
        }
        fn bring_core_offline(&self, core: CoreId) -> Result<(), ActuatorError> {
            self.cpus.bring_core_offline(core)
        }
        fn is_core_online(&self, core: CoreId) -> bool {
            self.cpus.is_core_online(core)
        }
    }

    #[test]
    fn test_service_lifecycle() {
        let (mut service, _) = service(2, true);
        assert!(service.is_enabled());
        thread::sleep(Duration::from_millis(30));
        service.stop();
        assert!(service.handle.is_none());
    }

    #[test]
    fn test_suspend_then_resume_restores_cores() {
        let (service, cpus) = service(4, true);
        service.suspend();
        assert_eq!(cpus.online_mask(), vec![true, false, false, false]);
        assert!(service.governor().cores().any_suspended());

        service.resume();
        assert_eq!(cpus.online_mask(), vec![true; 4]);
        assert!(!service.governor().cores().any_suspended());
    }

    #[test]
    fn test_suspend_halts_loop_and_resume_ticks_at_once() {
        let cpus = Arc::new(SimulatedCpus::new(4, 1_000_000));
        for core in 1..4 {
            cpus.set_online(core, false);
        }
        cpus.set_queue_depth(80);
        let service = start_with(cpus.clone(), 4, true, instant_up);
        assert!(
            wait_for(|| cpus.online_count() > 1).is_some(),
            "the loop should scale up under load"
        );

        service.suspend();
        assert_eq!(cpus.online_mask(), vec![true, false, false, false]);
        let calls = cpus.transition_calls();
        let state = service.governor().engine_state();
        // Ten tick intervals with a load that would otherwise scale.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cpus.transition_calls(), calls);
        assert_eq!(service.governor().engine_state(), state);
        assert_eq!(cpus.online_count(), 1);

        service.tunables().set_delay_ms(10_000).unwrap();
        service.resume();
        assert!(service.governor().engine_state().needs_reconcile);
        let elapsed = wait_for(|| !service.governor().engine_state().needs_reconcile);
        assert!(
            elapsed.is_some(),
            "resume should tick immediately, not after the 10s delay"
        );
    }

    #[test]
    fn test_suspend_waits_for_tick_in_flight() {
        let platform = Arc::new(SlowUp {
            cpus: SimulatedCpus::new(2, 1_000_000),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        platform.cpus.set_online(1, false);
        platform.cpus.set_queue_depth(80);
        let service = start_with(platform.clone(), 2, true, instant_up);

        assert!(wait_for(|| platform.started.load(Ordering::SeqCst)).is_some());
        service.suspend();
        assert!(
            platform.finished.load(Ordering::SeqCst),
            "suspend returned while a transition was still running"
        );
        assert_eq!(platform.cpus.online_mask(), vec![true, false]);
        let record = service.governor().cores().record(1).unwrap();
        assert_eq!(record.hotplug_count, 1);
        assert_eq!(record.unplug_count, 1);
        assert!(record.suspended);
    }

    #[test]
    fn test_suspend_is_noop_without_single_core_policy() {
        let (service, cpus) = service(2, true);
        service.tunables().set_scroff_single_core(false);
        service.suspend();
        assert_eq!(cpus.online_mask(), vec![true, true]);
        service.resume();
        assert_eq!(cpus.online_mask(), vec![true, true]);
    }

    #[test]
    fn test_disable_brings_cores_online_and_stops_deciding() {
        let (service, cpus) = service(3, true);
        cpus.set_online(2, false);
        assert!(service.disable());
        assert!(!service.disable());
        assert_eq!(cpus.online_mask(), vec![true; 3]);
        assert_eq!(service.get("enabled").unwrap(), "0");

        let calls = cpus.transition_calls();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cpus.transition_calls(), calls);

        service.set("enabled", "1").unwrap();
        assert!(service.is_enabled());
    }

    #[test]
    fn test_named_tunables_through_service() {
        let (service, _) = service(2, false);
        service.set("pause", "42").unwrap();
        assert_eq!(service.get("pause").unwrap(), "42");
        assert!(matches!(
            service.set("min_cpus", "3"),
            Err(ServiceError::Config(ConfigError::OutOfRange { .. }))
        ));
        assert!(matches!(
            service.set("enabled", "yes"),
            Err(ServiceError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
