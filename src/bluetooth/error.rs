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

//! Fatal peripheral errors.

use thiserror::Error;

use super::advertiser::AdvertisingError;
use super::transport::TransportError;

/// Errors that stop the peripheral.
#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("bluetooth init failed: {0}")]
    BringUp(TransportError),
    #[error("service 0x{uuid:04x} registration failed: {source}")]
    Registration { uuid: u16, source: TransportError },
    #[error("service 0x{uuid:04x} includes unregistered service 0x{missing:04x}")]
    Dependency { uuid: u16, missing: u16 },
    #[error(transparent)]
    Advertising(#[from] AdvertisingError),
    #[error("event dispatcher stopped unexpectedly: {0}")]
    Dispatcher(String),
}

impl PeripheralError {
    /// Process exit status used when distinct exit codes are enabled.
    pub fn exit_code(&self) -> u8 {
        match self {
            PeripheralError::BringUp(_) => 2,
            PeripheralError::Registration { .. } | PeripheralError::Dependency { .. } => 3,
            PeripheralError::Advertising(_) => 4,
            PeripheralError::Dispatcher(_) => 1,
        }
    }

    /// A crash inside the process rather than a stack or radio failure.
    pub fn is_internal(&self) -> bool {
        matches!(self, PeripheralError::Dispatcher(_))
    }
}
