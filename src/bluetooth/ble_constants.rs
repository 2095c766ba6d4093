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

//! Fixed identifiers and parameters of the fuzz peripheral.

use uuid::Uuid;

/// Custom fuzz service.
pub const CUSTOM_SERVICE_UUID16: u16 = 0x1BFF;
/// Read/write/notify/indicate characteristic inside the custom service.
pub const CUSTOM_CHAR_UUID16: u16 = 0x1B00;
/// Service whose only content is an include of the custom service.
pub const INCLUSION_SERVICE_UUID16: u16 = 0x2802;

pub const HEART_RATE_SERVICE_UUID16: u16 = 0x180D;
pub const HEART_RATE_MEASUREMENT_UUID16: u16 = 0x2A37;
/// Second UUID carried in the advertising data.
pub const ADVERTISED_EXTRA_UUID16: u16 = 0x2AFF;

// GATT attribute types
pub const PRIMARY_SERVICE_UUID16: u16 = 0x2800;
pub const INCLUDE_UUID16: u16 = 0x2802;
pub const CHARACTERISTIC_UUID16: u16 = 0x2803;
pub const CCC_UUID16: u16 = 0x2902;

/// Capacity of the custom characteristic value.
pub const CUSTOM_VALUE_CAPACITY: usize = 512;
/// Contents of the custom value at boot; the rest of the buffer is zero.
pub const CUSTOM_VALUE_INITIAL: &[u8] = b"Initial value";

/// Expand a 16-bit SIG UUID onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

/// Link and advertising parameters.
pub mod config {
    /// Connection interval, in 1.25 ms units.
    pub const CONN_INTERVAL_MIN: u16 = 10;
    pub const CONN_INTERVAL_MAX: u16 = 10;
    pub const CONN_LATENCY: u16 = 0;
    /// Supervision timeout, in 10 ms units.
    pub const CONN_SUPERVISION_TIMEOUT: u16 = 100;

    /// Fast advertising interval 1 (30 ms - 60 ms), in 0.625 ms units.
    pub const ADV_FAST_INTERVAL_MIN: u16 = 0x0030;
    pub const ADV_FAST_INTERVAL_MAX: u16 = 0x0060;

    /// Default ATT MTU before any exchange.
    pub const DEFAULT_MTU: u16 = 23;

    pub const DEFAULT_DEVICE_NAME: &str = "peripheral_fuzz";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid16_expands_onto_base_uuid() {
        assert_eq!(
            uuid16(0x180D).to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            uuid16(CUSTOM_SERVICE_UUID16).to_string(),
            "00001bff-0000-1000-8000-00805f9b34fb"
        );
    }
}
