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

//! Advertising control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use super::ble_constants::{ADVERTISED_EXTRA_UUID16, HEART_RATE_SERVICE_UUID16};
use super::transport::{AdvertisingParams, Transport, TransportError};

/// Largest legacy advertising or scan response payload.
pub const MAX_LEGACY_DATA_LEN: usize = 31;

// AD types
const AD_FLAGS: u8 = 0x01;
const AD_UUID16_ALL: u8 = 0x03;
const AD_NAME_SHORTENED: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;

// AD flags
const AD_FLAG_GENERAL: u8 = 0x02;
const AD_FLAG_NO_BREDR: u8 = 0x04;

#[derive(Debug, Error)]
pub enum AdvertisingError {
    #[error("advertising failed to start: {0}")]
    Rejected(#[from] TransportError),
    #[error("advertising start already in flight")]
    InFlight,
}

/// Advertising data and scan response, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPayload {
    service_uuids: Vec<u16>,
    device_name: String,
    ad: Vec<u8>,
    sd: Vec<u8>,
}

impl AdvertisingPayload {
    /// Flags plus the advertised 16-bit UUIDs, and the device name in the scan
    /// response.
    pub fn new(device_name: &str) -> Self {
        let service_uuids = vec![HEART_RATE_SERVICE_UUID16, ADVERTISED_EXTRA_UUID16];

        let mut ad = Vec::with_capacity(MAX_LEGACY_DATA_LEN);
        push_structure(&mut ad, AD_FLAGS, &[AD_FLAG_GENERAL | AD_FLAG_NO_BREDR]);
        for uuid in &service_uuids {
            push_structure(&mut ad, AD_UUID16_ALL, &uuid.to_le_bytes());
        }

        // Two bytes of header; names that do not fit are sent shortened.
        let mut sd = Vec::with_capacity(MAX_LEGACY_DATA_LEN);
        let name = device_name.as_bytes();
        if name.len() + 2 <= MAX_LEGACY_DATA_LEN {
            push_structure(&mut sd, AD_NAME_COMPLETE, name);
        } else {
            push_structure(&mut sd, AD_NAME_SHORTENED, &name[..MAX_LEGACY_DATA_LEN - 2]);
        }

        Self {
            service_uuids,
            device_name: device_name.to_string(),
            ad,
            sd,
        }
    }

    pub fn service_uuids(&self) -> &[u16] {
        &self.service_uuids
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Encoded advertising data.
    pub fn ad(&self) -> &[u8] {
        &self.ad
    }

    /// Encoded scan response data.
    pub fn sd(&self) -> &[u8] {
        &self.sd
    }
}

fn push_structure(buf: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    buf.push((data.len() + 1) as u8);
    buf.push(ad_type);
    buf.extend_from_slice(data);
}

/// Starts advertising with the fixed parameters and payload.
pub struct AdvertiserController {
    transport: Arc<dyn Transport>,
    params: AdvertisingParams,
    payload: AdvertisingPayload,
    in_flight: AtomicBool,
}

impl AdvertiserController {
    pub fn new(transport: Arc<dyn Transport>, device_name: &str) -> Self {
        Self {
            transport,
            params: AdvertisingParams::CONN_FAST_1,
            payload: AdvertisingPayload::new(device_name),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &AdvertisingPayload {
        &self.payload
    }

    /// Initial start at boot. Failure is fatal for the caller; nothing is retried.
    pub async fn start(&self) -> Result<(), AdvertisingError> {
        info!("Starting Legacy Advertising (connectable and scannable)");
        self.advertise().await?;
        info!("Advertising successfully started");
        Ok(())
    }

    /// Same as [`start`](Self::start), run after a connection has ended.
    pub async fn restart(&self) -> Result<(), AdvertisingError> {
        info!("Restarting Legacy Advertising (connectable and scannable)");
        self.advertise().await?;
        info!("Advertising successfully restarted");
        Ok(())
    }

    async fn advertise(&self) -> Result<(), AdvertisingError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(AdvertisingError::InFlight);
        }

        let result = self
            .transport
            .start_advertising(&self.params, &self.payload)
            .await;
        self.in_flight.store(false, Ordering::Release);

        result.map_err(|e| {
            error!("Advertising failed to start ({})", e);
            AdvertisingError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{FailurePlan, SimTransport, TransportCall};

    #[test]
    fn test_payload_encoding() {
        let payload = AdvertisingPayload::new("fuzz");
        assert_eq!(
            payload.ad(),
            &[0x02, 0x01, 0x06, 0x03, 0x03, 0x0D, 0x18, 0x03, 0x03, 0xFF, 0x2A]
        );
        assert_eq!(payload.sd(), &[0x05, 0x09, b'f', b'u', b'z', b'z']);
    }

    #[test]
    fn test_long_name_is_shortened() {
        let name = "a-very-long-peripheral-name-that-overflows";
        let payload = AdvertisingPayload::new(name);
        assert_eq!(payload.sd().len(), MAX_LEGACY_DATA_LEN);
        assert_eq!(payload.sd()[1], AD_NAME_SHORTENED);
        assert_eq!(payload.device_name(), name);
    }

    #[tokio::test]
    async fn test_restart_uses_boot_payload() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::new());
        let advertiser = AdvertiserController::new(transport.clone(), "fuzz");

        advertiser.start().await?;
        advertiser.restart().await?;

        let starts: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::StartAdvertising { .. }))
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0], starts[1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_start_is_not_retried() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            advertising_from: Some(0),
            ..Default::default()
        }));
        let advertiser = AdvertiserController::new(transport.clone(), "fuzz");

        let err = advertiser.start().await.unwrap_err();
        assert!(matches!(err, AdvertisingError::Rejected(_)));
        assert_eq!(transport.advertising_starts(), 0);
        assert_eq!(transport.calls().len(), 1);
    }
}
