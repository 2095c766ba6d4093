// Copyright 2026 Daniel Pelikan
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

//! Heart-rate service notification state.
//!
//! The service itself belongs to the host stack. Only its notification-enable
//! callback is observed here.

use tracing::info;

#[derive(Debug, Default)]
pub struct NotificationSubscription {
    enabled: bool,
}

impl NotificationSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notification-enable callback.
    pub fn ntf_changed(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "Heart rate notifications {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
