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

//! Contracts for the hardware the governor drives.
//!
//! The governor never touches the platform directly. It reads load and clock
//! rates through a [`CoreTelemetry`] and flips cores through a [`CoreActuator`].
//! Concrete implementations live in `hotplug-infra`.

use crate::control::CoreId;
use thiserror::Error;

/// Why a requested core transition could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    /// The core is already in the requested state.
    #[error("core {core} is already in the requested state (online: {online})")]
    AlreadyInState {
        /// The core that was addressed.
        core: CoreId,
        /// The state the core is already in.
        online: bool,
    },
    /// The platform refused the transition.
    #[error("core {core} refused the transition: {reason}")]
    Refused {
        /// The core that was addressed.
        core: CoreId,
        /// Platform-provided explanation.
        reason: String,
    },
}

impl ActuatorError {
    /// Returns the core the failed request addressed.
    pub fn core(&self) -> CoreId {
        match self {
            ActuatorError::AlreadyInState { core, .. } | ActuatorError::Refused { core, .. } => {
                *core
            }
        }
    }
}

/// Cheap, synchronous source of the load signals the decision engine consumes.
pub trait CoreTelemetry: Send + Sync {
    /// Returns the current run-queue depth, in tenths of a runnable task.
    ///
    /// A value of `35` means three and a half tasks are contending for cores.
    fn read_queue_depth(&self) -> u32;

    /// Returns the current clock rate of `core` in kHz.
    ///
    /// Offline or unreadable cores report `0`.
    fn read_core_clock_rate(&self, core: CoreId) -> u64;
}

/// Performs core online/offline transitions and answers ground-truth queries.
///
/// Each call is assumed atomic with respect to the platform.
pub trait CoreActuator: Send + Sync {
    /// Brings `core` online.
    fn bring_core_online(&self, core: CoreId) -> Result<(), ActuatorError>;

    /// Takes `core` offline.
    fn bring_core_offline(&self, core: CoreId) -> Result<(), ActuatorError>;

    /// Returns whether `core` is online right now.
    fn is_core_online(&self, core: CoreId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reports_addressed_core() {
        let err = ActuatorError::AlreadyInState {
            core: 2,
            online: false,
        };
        assert_eq!(err.core(), 2);
        assert_eq!(
            err.to_string(),
            "core 2 is already in the requested state (online: false)"
        );

        let err = ActuatorError::Refused {
            core: 3,
            reason: "busy".into(),
        };
        assert_eq!(err.core(), 3);
        assert_eq!(err.to_string(), "core 3 refused the transition: busy");
    }
}
