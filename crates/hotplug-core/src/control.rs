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

//! Shared vocabulary of the control loop.

use serde::{Deserialize, Serialize};

/// Index of a core, `0..N`.
pub type CoreId = usize;

/// The primary core. It is never taken offline.
pub const PRIMARY_CORE: CoreId = 0;

/// Outcome of one decision round, also used as the governor's operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Decision {
    /// The governor is switched off. Terminal until explicitly re-enabled.
    Disabled,
    /// Nothing to do this round.
    #[default]
    Idle,
    /// Take one core offline.
    Down,
    /// Bring one core online.
    Up,
}

impl Decision {
    /// Returns `true` unless the governor is switched off.
    pub fn is_enabled(self) -> bool {
        self != Decision::Disabled
    }
}
