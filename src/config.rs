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

//! Configuration file handling.
//!
//! Settings are read from a TOML file. Every field is optional and missing
//! values fall back to the built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::bluetooth::ble_constants::config::DEFAULT_DEVICE_NAME;
use crate::bluetooth::{hci, PeripheralSettings};

const APP_DIR: &str = "peripheral-fuzz";
const CONFIG_FILE: &str = "config.toml";

/// Logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
            show_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Options of the simulated backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Connection cycles the scripted central runs before hanging up.
    pub cycles: usize,
    pub seed: u64,
    /// Largest fragment of a long write.
    pub max_fragment: usize,
    /// HCI reason reported on every disconnect.
    pub disconnect_reason: u8,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            cycles: 5,
            seed: 0x5EED,
            max_fragment: 18,
            disconnect_reason: hci::REMOTE_USER_TERMINATED,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name carried in the scan response.
    pub device_name: String,
    /// Depth of the transport event channel.
    pub event_queue_depth: usize,
    /// Pause between lines of the boot-time attribute listing.
    pub attribute_walk_delay_ms: u64,
    /// Exit with distinct non-zero codes on fatal errors instead of always 0.
    pub strict_exit_codes: bool,
    pub logging: LogSettings,
    pub sim: SimSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            event_queue_depth: 32,
            attribute_walk_delay_ms: 50,
            strict_exit_codes: false,
            logging: LogSettings::default(),
            sim: SimSettings::default(),
        }
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/peripheral-fuzz/config.toml`, if a config dir is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load `path`, or the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;

        anyhow::ensure!(
            config.event_queue_depth > 0,
            "event_queue_depth must be at least 1"
        );
        Ok(config)
    }

    pub fn peripheral_settings(&self) -> PeripheralSettings {
        PeripheralSettings {
            device_name: self.device_name.clone(),
            attribute_walk_delay: Duration::from_millis(self.attribute_walk_delay_ms),
        }
    }
}
