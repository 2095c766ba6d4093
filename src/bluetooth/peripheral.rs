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

//! Peripheral bring-up and main loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::advertiser::AdvertiserController;
use super::attribute_store::AttributeStore;
use super::ble_constants::{
    config, CUSTOM_CHAR_UUID16, CUSTOM_SERVICE_UUID16, INCLUSION_SERVICE_UUID16,
};
use super::catalog::{ServiceCatalog, ServiceDeclaration};
use super::connection::ConnectionTracker;
use super::error::PeripheralError;
use super::pairing::PairingPolicy;
use super::transport::{Transport, TransportEvent};
use crate::events::EventDispatcher;

/// Runtime settings of a [`Peripheral`].
#[derive(Debug, Clone)]
pub struct PeripheralSettings {
    pub device_name: String,
    /// Pause before each line of the boot-time attribute listing.
    pub attribute_walk_delay: Duration,
}

impl Default for PeripheralSettings {
    fn default() -> Self {
        Self {
            device_name: config::DEFAULT_DEVICE_NAME.to_string(),
            attribute_walk_delay: Duration::from_millis(50),
        }
    }
}

/// One running peripheral and everything it owns.
pub struct Peripheral {
    transport: Arc<dyn Transport>,
    tracker: Arc<ConnectionTracker>,
    advertiser: AdvertiserController,
    catalog: ServiceCatalog,
    settings: PeripheralSettings,
}

impl Peripheral {
    pub fn new(transport: Arc<dyn Transport>, settings: PeripheralSettings) -> Self {
        Self {
            tracker: Arc::new(ConnectionTracker::new(transport.clone())),
            advertiser: AdvertiserController::new(transport.clone(), &settings.device_name),
            catalog: ServiceCatalog::new(transport.clone()),
            transport,
            settings,
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn advertiser(&self) -> &AdvertiserController {
        &self.advertiser
    }

    /// Handle of the custom characteristic value, once registered.
    pub fn value_handle(&self) -> Option<u16> {
        self.catalog
            .service(CUSTOM_SERVICE_UUID16)
            .and_then(|s| s.value_handle(CUSTOM_CHAR_UUID16))
    }

    /// Enable the stack, clear old bonds, register services and start advertising.
    pub async fn bring_up(&mut self) -> Result<(), PeripheralError> {
        self.transport.enable().await.map_err(|e| {
            error!("Bluetooth init failed (err {})", e);
            PeripheralError::BringUp(e)
        })?;
        info!("Bluetooth initialized");

        if let Err(e) = self.transport.unpair(None).await {
            warn!("Failed to unpair devices (err {})", e);
        }

        match self.transport.identity().await {
            Ok(addr) => info!("Addr : {}", addr),
            Err(e) => warn!("Failed to read identity address: {}", e),
        }

        self.catalog.register(ServiceDeclaration::custom()).await?;
        self.catalog
            .register_inclusion(INCLUSION_SERVICE_UUID16, CUSTOM_SERVICE_UUID16)
            .await?;
        self.catalog
            .log_attributes(0x0001, 0xFFFF, self.settings.attribute_walk_delay)
            .await;

        PairingPolicy::new(self.transport.clone()).register().await;

        self.advertiser.start().await?;
        Ok(())
    }

    /// Dispatch `events` and re-advertise after every disconnect.
    ///
    /// Returns once the stack closes the event channel, or with the first fatal
    /// advertising error.
    pub async fn run(self, events: mpsc::Receiver<TransportEvent>) -> Result<(), PeripheralError> {
        let dispatcher = EventDispatcher::new(
            self.tracker.clone(),
            PairingPolicy::new(self.transport.clone()),
            AttributeStore::new(),
            self.value_handle(),
        );
        let mut dispatch = tokio::spawn(dispatcher.run(events));

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.tracker.signalled() => {
                    if let Err(e) = self.drain().await {
                        break Err(e);
                    }
                }
                joined = &mut dispatch => {
                    break match joined {
                        Ok(_) => self.drain().await,
                        Err(e) => Err(Self::dispatcher_failed(e)),
                    };
                }
            }
        };

        dispatch.abort();
        outcome
    }

    /// The dispatcher panicked or was cancelled; pending flags are not trusted.
    fn dispatcher_failed(e: JoinError) -> PeripheralError {
        error!("Event dispatcher failed: {}", e);
        PeripheralError::Dispatcher(e.to_string())
    }

    async fn drain(&self) -> Result<(), PeripheralError> {
        if self.tracker.take_connected() {
            debug!("Connection observed by main loop");
        }
        if self.tracker.take_disconnected() {
            self.advertiser.restart().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::hci;
    use crate::bluetooth::sim::{FailurePlan, SimCentral, SimTransport, TransportCall};
    use crate::bluetooth::transport::ConnParams;
    use crate::bluetooth::ConnectionState;

    const PEER: crate::bluetooth::PeerAddress = SimCentral::PEER;

    fn settings() -> PeripheralSettings {
        PeripheralSettings {
            device_name: "fuzz".to_string(),
            attribute_walk_delay: Duration::ZERO,
        }
    }

    async fn booted(transport: &Arc<SimTransport>) -> Peripheral {
        let mut peripheral = Peripheral::new(transport.clone(), settings());
        peripheral.bring_up().await.expect("bring-up");
        peripheral
    }

    fn advertising(calls: &[TransportCall]) -> Vec<TransportCall> {
        calls
            .iter()
            .filter(|c| matches!(c, TransportCall::StartAdvertising { .. }))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_bring_up_sequence() {
        let transport = Arc::new(SimTransport::new());
        let peripheral = booted(&transport).await;

        assert_eq!(peripheral.value_handle(), Some(3));
        let calls = transport.calls();
        assert_eq!(
            calls[..6],
            [
                TransportCall::Enable,
                TransportCall::Unpair(None),
                TransportCall::Identity,
                TransportCall::RegisterService(CUSTOM_SERVICE_UUID16),
                TransportCall::RegisterService(INCLUSION_SERVICE_UUID16),
                TransportCall::SetFixedPasskey(Some(0)),
            ]
        );
        assert!(matches!(calls[6], TransportCall::StartAdvertising { .. }));
        assert_eq!(calls.len(), 7);
    }

    #[tokio::test]
    async fn test_bring_up_failure_is_fatal() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            enable: true,
            ..Default::default()
        }));
        let mut peripheral = Peripheral::new(transport.clone(), settings());

        let err = peripheral.bring_up().await.unwrap_err();
        assert!(matches!(err, PeripheralError::BringUp(_)));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(transport.calls(), vec![TransportCall::Enable]);
    }

    #[tokio::test]
    async fn test_unpair_failure_at_boot_is_not_fatal() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            unpair: true,
            ..Default::default()
        }));
        booted(&transport).await;
        assert_eq!(transport.advertising_starts(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_restarts_advertising_with_boot_payload() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::new());
        let peripheral = booted(&transport).await;
        let boot_payload = peripheral.advertiser().payload().clone();

        let (tx, rx) = mpsc::channel(8);
        tx.send(TransportEvent::Connected {
            peer: PEER,
            status: hci::SUCCESS,
        })
        .await?;
        tx.send(TransportEvent::Disconnected {
            peer: PEER,
            reason: hci::REMOTE_USER_TERMINATED,
        })
        .await?;
        drop(tx);

        let tracker = peripheral.tracker().clone();
        peripheral.run(rx).await?;

        let calls = transport.calls();
        let tail = &calls[7..];
        assert_eq!(tail[0], TransportCall::UpdateConnParams(PEER, ConnParams::FIXED));
        assert_eq!(tail[1], TransportCall::Unpair(Some(PEER)));
        assert!(matches!(tail[2], TransportCall::StartAdvertising { .. }));
        assert_eq!(tail.len(), 3);

        let starts = advertising(&calls);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0], starts[1]);
        assert_eq!(
            starts[1],
            TransportCall::StartAdvertising {
                ad: boot_payload.ad().to_vec(),
                sd: boot_payload.sd().to_vec(),
            }
        );
        assert_eq!(tracker.state(), ConnectionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatcher_panic_is_fatal() {
        let joined = tokio::spawn(async { panic!("dispatcher crashed") }).await;
        let err = Peripheral::dispatcher_failed(joined.unwrap_err());

        assert!(matches!(err, PeripheralError::Dispatcher(_)));
        assert!(err.is_internal());
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_repeated_disconnect_restarts_once() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::new());
        let peripheral = booted(&transport).await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(TransportEvent::Connected {
            peer: PEER,
            status: hci::SUCCESS,
        })
        .await?;
        for _ in 0..2 {
            tx.send(TransportEvent::Disconnected {
                peer: PEER,
                reason: hci::CONNECTION_TIMEOUT,
            })
            .await?;
        }
        drop(tx);

        peripheral.run(rx).await?;

        assert_eq!(advertising(&transport.calls()).len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_connect_requests_nothing() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::new());
        let peripheral = booted(&transport).await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(TransportEvent::Connected {
            peer: PEER,
            status: hci::CONN_FAILED_TO_BE_ESTABLISHED,
        })
        .await?;
        drop(tx);

        let tracker = peripheral.tracker().clone();
        peripheral.run(rx).await?;

        assert_eq!(transport.calls().len(), 7);
        assert_eq!(tracker.state(), ConnectionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_failure_stops_the_loop() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            advertising_from: Some(1),
            ..Default::default()
        }));
        let peripheral = booted(&transport).await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(TransportEvent::Disconnected {
            peer: PEER,
            reason: hci::REMOTE_USER_TERMINATED,
        })
        .await?;

        let err = peripheral.run(rx).await.unwrap_err();
        assert!(matches!(err, PeripheralError::Advertising(_)));
        assert_eq!(err.exit_code(), 4);
        drop(tx);
        Ok(())
    }

    #[tokio::test]
    async fn test_simulated_central_session() -> anyhow::Result<()> {
        let transport = Arc::new(SimTransport::new());
        let mut peripheral = Peripheral::new(transport.clone(), settings());
        let (tx, rx) = mpsc::channel(32);

        peripheral.bring_up().await?;
        let value_handle = peripheral.value_handle().expect("custom value registered");

        let mut central = SimCentral::new(tx, transport.clone(), value_handle, 7).max_fragment(40);
        let session = tokio::spawn(async move { central.run(3, hci::REMOTE_USER_TERMINATED).await });

        peripheral.run(rx).await?;
        let report = session.await??;

        assert_eq!(report.cycles, 3);
        assert_eq!(report.rejected_writes, 3);
        assert_eq!(report.mismatches, 0);
        assert_eq!(transport.advertising_starts(), 4);
        assert_eq!(
            transport.count(|c| *c == TransportCall::Unpair(Some(SimCentral::PEER))),
            3
        );
        Ok(())
    }
}
