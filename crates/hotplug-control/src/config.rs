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


//! Runtime tunables of the governor.
//!
//! Every field is an independent atomic so the control loop reads the current
//! values without taking a lock. Writes are validated at the call site and a
//! rejected write leaves the previous value in place. Writers of `min_cpus` and
//! `max_cpus` are serialised so the `min <= max` check cannot interleave.
//!
//! The same fields are addressable by name (see [`Tunables::get`] and
//! [`Tunables::set`]) for text front-ends, and as a serialisable
//! [`TunablesSnapshot`] for configuration files.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Grace period after start-up during which no decision is taken (ms).
pub const DEFAULT_START_DELAY_MS: u64 = 20_000;
/// Interval between control loop ticks (ms).
pub const DEFAULT_DELAY_MS: u64 = 100;
/// Backoff after a failed transition (ms).
pub const DEFAULT_PAUSE_MS: u64 = 10_000;
/// Clock rate (kHz) at or below which a core counts as idling.
pub const DEFAULT_IDLE_FREQ_KHZ: u64 = 384_000;

const DEFAULT_UP_QUEUE: u32 = 35;
const DEFAULT_DOWN_QUEUE: u32 = 5;
const DEFAULT_STABLE_MS: u64 = 250;

const QUEUE_THRESHOLD_PREFIX: &str = "nwns_threshold_";
const STABLE_THRESHOLD_PREFIX: &str = "twts_threshold_";

/// Errors raised when a tunable write is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A governor needs at least the primary core.
    #[error("the governor needs at least one core")]
    NoCores,
    /// A numeric value fell outside its permitted range.
    #[error("{key} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// Name of the tunable.
        key: &'static str,
        /// Rejected value.
        value: u64,
        /// Inclusive lower bound.
        min: u64,
        /// Inclusive upper bound.
        max: u64,
    },
    /// The write would leave `min_cpus` above `max_cpus`.
    #[error("min_cpus ({min}) must not exceed max_cpus ({max})")]
    MinAboveMax {
        /// Resulting lower bound.
        min: usize,
        /// Resulting upper bound.
        max: usize,
    },
    /// The threshold bucket does not exist for this core count.
    #[error("threshold bucket {bucket} does not exist ({buckets} buckets)")]
    UnknownBucket {
        /// Requested bucket.
        bucket: usize,
        /// Number of buckets available.
        buckets: usize,
    },
    /// No tunable carries this name.
    #[error("unknown tunable '{0}'")]
    UnknownKey(String),
    /// The text could not be parsed for this tunable.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        /// Name of the tunable.
        key: String,
        /// Rejected text.
        value: String,
    },
}

/// Thresholds for one online-core-count bucket.
///
/// Bucket `b` applies while `b + 1` cores are online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketThresholds {
    /// Queue depth at or above which scaling up is considered.
    pub up_queue: u32,
    /// Time the load must stay high before a core is added (ms).
    pub up_stable_ms: u64,
    /// Queue depth at or below which scaling down is considered.
    pub down_queue: u32,
    /// Time the load must stay low before a core is removed (ms).
    pub down_stable_ms: u64,
}

impl BucketThresholds {
    /// Default thresholds of `bucket` on a machine with `cores` cores.
    ///
    /// On a dual-core machine this yields the classic
    /// `[35, 0, 0, 5]` / `[250, 0, 0, 250]` tables.
    pub fn default_for(bucket: usize, cores: usize) -> Self {
        let up = bucket + 1 < cores;
        let down = bucket > 0;
        Self {
            up_queue: if up { DEFAULT_UP_QUEUE } else { 0 },
            up_stable_ms: if up { DEFAULT_STABLE_MS } else { 0 },
            down_queue: if down { DEFAULT_DOWN_QUEUE } else { 0 },
            down_stable_ms: if down { DEFAULT_STABLE_MS } else { 0 },
        }
    }
}

#[derive(Debug)]
struct AtomicBucket {
    up_queue: AtomicU32,
    up_stable_ms: AtomicU64,
    down_queue: AtomicU32,
    down_stable_ms: AtomicU64,
}

impl AtomicBucket {
    fn new(thresholds: BucketThresholds) -> Self {
        Self {
            up_queue: AtomicU32::new(thresholds.up_queue),
            up_stable_ms: AtomicU64::new(thresholds.up_stable_ms),
            down_queue: AtomicU32::new(thresholds.down_queue),
            down_stable_ms: AtomicU64::new(thresholds.down_stable_ms),
        }
    }

    fn load(&self) -> BucketThresholds {
        BucketThresholds {
            up_queue: self.up_queue.load(Ordering::Relaxed),
            up_stable_ms: self.up_stable_ms.load(Ordering::Relaxed),
            down_queue: self.down_queue.load(Ordering::Relaxed),
            down_stable_ms: self.down_stable_ms.load(Ordering::Relaxed),
        }
    }

    fn store(&self, thresholds: BucketThresholds) {
        self.up_queue.store(thresholds.up_queue, Ordering::Relaxed);
        self.up_stable_ms
            .store(thresholds.up_stable_ms, Ordering::Relaxed);
        self.down_queue
            .store(thresholds.down_queue, Ordering::Relaxed);
        self.down_stable_ms
            .store(thresholds.down_stable_ms, Ordering::Relaxed);
    }
}

/// Which half of a flattened threshold slot is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThresholdKind {
    Queue,
    Stable,
}

/// Live tunables shared between the control loop and its front-ends.
#[derive(Debug)]
pub struct Tunables {
    cores: usize,
    start_delay_ms: AtomicU64,
    delay_ms: AtomicU64,
    pause_ms: AtomicU64,
    scroff_single_core: AtomicBool,
    idle_freq: AtomicU64,
    min_cores: AtomicUsize,
    max_cores: AtomicUsize,
    buckets: Box<[AtomicBucket]>,
    writer: Mutex<()>,
}

impl Tunables {
    /// Creates the default tunables for a machine with `cores` cores.
    pub fn new(cores: usize) -> Result<Self, ConfigError> {
        if cores == 0 {
            return Err(ConfigError::NoCores);
        }
        let buckets = (0..cores)
            .map(|bucket| AtomicBucket::new(BucketThresholds::default_for(bucket, cores)))
            .collect();
        Ok(Self {
            cores,
            start_delay_ms: AtomicU64::new(DEFAULT_START_DELAY_MS),
            delay_ms: AtomicU64::new(DEFAULT_DELAY_MS),
            pause_ms: AtomicU64::new(DEFAULT_PAUSE_MS),
            scroff_single_core: AtomicBool::new(true),
            idle_freq: AtomicU64::new(DEFAULT_IDLE_FREQ_KHZ),
            min_cores: AtomicUsize::new(1),
            max_cores: AtomicUsize::new(cores),
            buckets,
            writer: Mutex::new(()),
        })
    }

    /// Number of possible cores. Fixed for the lifetime of the tunables.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// Start-up grace period (ms).
    pub fn start_delay_ms(&self) -> u64 {
        self.start_delay_ms.load(Ordering::Relaxed)
    }

    /// Interval between ticks (ms).
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    /// Backoff after a failed transition (ms).
    pub fn pause_ms(&self) -> u64 {
        self.pause_ms.load(Ordering::Relaxed)
    }

    /// Whether display-off forces single-core mode.
    pub fn scroff_single_core(&self) -> bool {
        self.scroff_single_core.load(Ordering::Relaxed)
    }

    /// Idle clock-rate floor (kHz).
    pub fn idle_freq(&self) -> u64 {
        self.idle_freq.load(Ordering::Relaxed)
    }

    /// Lowest number of cores kept online.
    pub fn min_cores(&self) -> usize {
        self.min_cores.load(Ordering::Relaxed)
    }

    /// Highest number of cores brought online.
    pub fn max_cores(&self) -> usize {
        self.max_cores.load(Ordering::Relaxed)
    }

    /// Thresholds of `bucket`, clamped to the last bucket.
    pub fn bucket(&self, bucket: usize) -> BucketThresholds {
        self.buckets[bucket.min(self.buckets.len() - 1)].load()
    }

    /// Sets the start-up grace period.
    pub fn set_start_delay_ms(&self, value: u64) {
        self.start_delay_ms.store(value, Ordering::Relaxed);
    }

    /// Sets the tick interval. Zero is rejected.
    pub fn set_delay_ms(&self, value: u64) -> Result<(), ConfigError> {
        check_range("delay", value, 1, u64::MAX)?;
        self.delay_ms.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Sets the backoff duration.
    pub fn set_pause_ms(&self, value: u64) {
        self.pause_ms.store(value, Ordering::Relaxed);
    }

    /// Enables or disables single-core mode while the display is off.
    pub fn set_scroff_single_core(&self, value: bool) {
        self.scroff_single_core.store(value, Ordering::Relaxed);
    }

    /// Sets the idle clock-rate floor (kHz).
    pub fn set_idle_freq(&self, value: u64) {
        self.idle_freq.store(value, Ordering::Relaxed);
    }

    /// Sets the lowest online core count; must be in `[1, N]` and `<= max`.
    pub fn set_min_cores(&self, value: usize) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        check_range("min_cpus", value as u64, 1, self.cores as u64)?;
        let max = self.max_cores();
        if value > max {
            return Err(ConfigError::MinAboveMax { min: value, max });
        }
        self.min_cores.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Sets the highest online core count; must be in `[1, N]` and `>= min`.
    pub fn set_max_cores(&self, value: usize) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        check_range("max_cpus", value as u64, 1, self.cores as u64)?;
        let min = self.min_cores();
        if value < min {
            return Err(ConfigError::MinAboveMax { min, max: value });
        }
        self.max_cores.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Replaces the thresholds of `bucket`.
    pub fn set_bucket(&self, bucket: usize, thresholds: BucketThresholds) -> Result<(), ConfigError> {
        let slot = self.buckets.get(bucket).ok_or(ConfigError::UnknownBucket {
            bucket,
            buckets: self.buckets.len(),
        })?;
        slot.store(thresholds);
        Ok(())
    }

    /// Reads a tunable by name.
    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "start_delay" => self.start_delay_ms().to_string(),
            "delay" => self.delay_ms().to_string(),
            "pause" => self.pause_ms().to_string(),
            "scroff_single_core" => u8::from(self.scroff_single_core()).to_string(),
            "idle_freq" => self.idle_freq().to_string(),
            "min_cpus" => self.min_cores().to_string(),
            "max_cpus" => self.max_cores().to_string(),
            _ => {
                let (kind, slot) = parse_threshold_key(key)?;
                self.threshold_slot(key, kind, slot)?.to_string()
            }
        };
        Ok(value)
    }

    /// Writes a tunable by name, parsing `value` as an unsigned integer.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "start_delay" => self.set_start_delay_ms(parse_u64(key, value)?),
            "delay" => self.set_delay_ms(parse_u64(key, value)?)?,
            "pause" => self.set_pause_ms(parse_u64(key, value)?),
            "scroff_single_core" => self.set_scroff_single_core(parse_flag(key, value)?),
            "idle_freq" => self.set_idle_freq(parse_u64(key, value)?),
            "min_cpus" => self.set_min_cores(parse_usize(key, value)?)?,
            "max_cpus" => self.set_max_cores(parse_usize(key, value)?)?,
            _ => {
                let (kind, slot) = parse_threshold_key(key)?;
                let parsed = parse_u64(key, value)?;
                self.set_threshold_slot(key, kind, slot, parsed)?;
            }
        }
        log::info!("Tunable {} set to {}", key, value.trim());
        Ok(())
    }

    /// Names of every tunable, in display order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [
            "start_delay",
            "delay",
            "pause",
            "scroff_single_core",
            "idle_freq",
            "min_cpus",
            "max_cpus",
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        let slots = self.buckets.len() * 2;
        keys.extend((0..slots).map(|i| format!("{QUEUE_THRESHOLD_PREFIX}{i}")));
        keys.extend((0..slots).map(|i| format!("{STABLE_THRESHOLD_PREFIX}{i}")));
        keys
    }

    /// Captures every tunable.
    pub fn snapshot(&self) -> TunablesSnapshot {
        TunablesSnapshot {
            start_delay_ms: self.start_delay_ms(),
            delay_ms: self.delay_ms(),
            pause_ms: self.pause_ms(),
            scroff_single_core: self.scroff_single_core(),
            idle_freq: self.idle_freq(),
            min_cpus: Some(self.min_cores()),
            max_cpus: Some(self.max_cores()),
            thresholds: self.buckets.iter().map(AtomicBucket::load).collect(),
        }
    }

    /// Validates `snapshot` as a whole, then stores every field.
    ///
    /// Nothing is written if any field is rejected.
    pub fn apply(&self, snapshot: &TunablesSnapshot) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        check_range("delay", snapshot.delay_ms, 1, u64::MAX)?;
        let min = snapshot.min_cpus.unwrap_or_else(|| self.min_cores());
        let max = snapshot.max_cpus.unwrap_or_else(|| self.max_cores());
        check_range("min_cpus", min as u64, 1, self.cores as u64)?;
        check_range("max_cpus", max as u64, 1, self.cores as u64)?;
        if min > max {
            return Err(ConfigError::MinAboveMax { min, max });
        }
        if snapshot.thresholds.len() > self.buckets.len() {
            return Err(ConfigError::UnknownBucket {
                bucket: snapshot.thresholds.len() - 1,
                buckets: self.buckets.len(),
            });
        }

        self.start_delay_ms
            .store(snapshot.start_delay_ms, Ordering::Relaxed);
        self.delay_ms.store(snapshot.delay_ms, Ordering::Relaxed);
        self.pause_ms.store(snapshot.pause_ms, Ordering::Relaxed);
        self.scroff_single_core
            .store(snapshot.scroff_single_core, Ordering::Relaxed);
        self.idle_freq.store(snapshot.idle_freq, Ordering::Relaxed);
        self.min_cores.store(min, Ordering::Relaxed);
        self.max_cores.store(max, Ordering::Relaxed);
        for (slot, thresholds) in self.buckets.iter().zip(&snapshot.thresholds) {
            slot.store(*thresholds);
        }
        Ok(())
    }

    fn threshold_slot(&self, key: &str, kind: ThresholdKind, slot: usize) -> Result<u64, ConfigError> {
        let bucket = self.bucket_for_slot(key, slot)?;
        let thresholds = self.buckets[bucket].load();
        let up = slot % 2 == 0;
        Ok(match (kind, up) {
            (ThresholdKind::Queue, true) => u64::from(thresholds.up_queue),
            (ThresholdKind::Queue, false) => u64::from(thresholds.down_queue),
            (ThresholdKind::Stable, true) => thresholds.up_stable_ms,
            (ThresholdKind::Stable, false) => thresholds.down_stable_ms,
        })
    }

    fn set_threshold_slot(
        &self,
        key: &str,
        kind: ThresholdKind,
        slot: usize,
        value: u64,
    ) -> Result<(), ConfigError> {
        let bucket = &self.buckets[self.bucket_for_slot(key, slot)?];
        let up = slot % 2 == 0;
        match kind {
            ThresholdKind::Queue => {
                let value = u32::try_from(value).map_err(|_| ConfigError::OutOfRange {
                    key: "nwns_threshold",
                    value,
                    min: 0,
                    max: u64::from(u32::MAX),
                })?;
                let target = if up { &bucket.up_queue } else { &bucket.down_queue };
                target.store(value, Ordering::Relaxed);
            }
            ThresholdKind::Stable => {
                let target = if up {
                    &bucket.up_stable_ms
                } else {
                    &bucket.down_stable_ms
                };
                target.store(value, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn bucket_for_slot(&self, key: &str, slot: usize) -> Result<usize, ConfigError> {
        let bucket = slot / 2;
        if bucket >= self.buckets.len() {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }
        Ok(bucket)
    }
}

/// Serialisable copy of every tunable, used for configuration files.
///
/// Missing fields take their defaults. `min_cpus`/`max_cpus` left out keep the
/// live values, and `thresholds` only overrides the buckets it lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunablesSnapshot {
    /// Start-up grace period (ms).
    pub start_delay_ms: u64,
    /// Tick interval (ms).
    pub delay_ms: u64,
    /// Backoff after a failed transition (ms).
    pub pause_ms: u64,
    /// Single-core mode while the display is off.
    pub scroff_single_core: bool,
    /// Idle clock-rate floor (kHz).
    pub idle_freq: u64,
    /// Lowest online core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cpus: Option<usize>,
    /// Highest online core count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpus: Option<usize>,
    /// Per-bucket thresholds, bucket 0 first.
    pub thresholds: Vec<BucketThresholds>,
}

impl Default for TunablesSnapshot {
    fn default() -> Self {
        Self {
            start_delay_ms: DEFAULT_START_DELAY_MS,
            delay_ms: DEFAULT_DELAY_MS,
            pause_ms: DEFAULT_PAUSE_MS,
            scroff_single_core: true,
            idle_freq: DEFAULT_IDLE_FREQ_KHZ,
            min_cpus: None,
            max_cpus: None,
            thresholds: Vec::new(),
        }
    }
}

fn check_range(key: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    let parsed = parse_u64(key, value)?;
    usize::try_from(parsed).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses a `0`/`1` switch.
pub(crate) fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_threshold_key(key: &str) -> Result<(ThresholdKind, usize), ConfigError> {
    let (kind, index) = if let Some(index) = key.strip_prefix(QUEUE_THRESHOLD_PREFIX) {
        (ThresholdKind::Queue, index)
    } else if let Some(index) = key.strip_prefix(STABLE_THRESHOLD_PREFIX) {
        (ThresholdKind::Stable, index)
    } else {
        return Err(ConfigError::UnknownKey(key.to_string()));
    };
    let slot = index
        .parse::<usize>()
        .map_err(|_| ConfigError::UnknownKey(key.to_string()))?;
    Ok((kind, slot))
}
