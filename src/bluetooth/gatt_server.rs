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

//! BlueZ host stack backend.
//!
//! Maps BlueZ advertising, GATT application callbacks, the pairing agent and
//! device connection properties onto [`TransportEvent`]s.

use bluer::adv::{Advertisement, AdvertisementHandle, Type as AdvertisementType};
use bluer::agent::{
    Agent, AgentHandle, DisplayPasskey, ReqError as AgentReqError, RequestAuthorization,
    RequestConfirmation, RequestPasskey,
};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, AddressType, DeviceEvent, DeviceProperty};
use futures::future::BoxFuture;
use futures::{pin_mut, FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::advertiser::AdvertisingPayload;
use super::attribute_store::AttError;
use super::ble_constants::{uuid16, HEART_RATE_MEASUREMENT_UUID16, HEART_RATE_SERVICE_UUID16};
use super::catalog::{AttributeKind, Properties, RegisteredService};
use super::hci;
use super::transport::{
    AddressKind, AdvertisingParams, AuthEvent, ConnParams, PeerAddress, Transport,
    TransportError, TransportEvent, WriteFlags,
};

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::Rejected(e.to_string())
    }
}

/// Answer to a pending agent request.
enum AgentAnswer {
    Passkey(u32),
    Confirm,
}

type PendingAuth = Arc<parking_lot::Mutex<HashMap<Address, oneshot::Sender<AgentAnswer>>>>;

fn peer_of(addr: Address) -> PeerAddress {
    PeerAddress::new(addr.0, AddressKind::Public)
}

fn att_to_req(e: AttError) -> ReqError {
    match e {
        AttError::InvalidOffset => ReqError::InvalidOffset,
        AttError::InvalidHandle => ReqError::NotSupported,
    }
}

/// BlueZ does not report the HCI reason to the peripheral role.
fn connection_event(addr: Address, connected: bool) -> TransportEvent {
    let peer = peer_of(addr);
    if connected {
        TransportEvent::Connected {
            peer,
            status: hci::SUCCESS,
        }
    } else {
        TransportEvent::Disconnected {
            peer,
            reason: hci::REMOTE_USER_TERMINATED,
        }
    }
}

/// Devices that already have a connection watcher.
#[derive(Debug, Default)]
struct WatchedDevices(HashSet<Address>);

impl WatchedDevices {
    /// Returns `true` if `addr` was not watched yet.
    fn claim(&mut self, addr: Address) -> bool {
        self.0.insert(addr)
    }

    fn release(&mut self, addr: Address) {
        self.0.remove(&addr);
    }
}

/// Host stack backed by the system BlueZ daemon.
pub struct BluezTransport {
    session: bluer::Session,
    adapter: Adapter,
    event_tx: mpsc::Sender<TransportEvent>,
    pending_auth: PendingAuth,
    fixed_passkey: parking_lot::Mutex<Option<u32>>,
    adv_handle: Mutex<Option<AdvertisementHandle>>,
    app_handles: Mutex<Vec<ApplicationHandle>>,
    agent_handle: Mutex<Option<AgentHandle>>,
}

impl BluezTransport {
    /// Connect to BlueZ and pick the default adapter.
    pub async fn new(event_tx: mpsc::Sender<TransportEvent>) -> Result<Self, TransportError> {
        info!("Connecting to BlueZ...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            session,
            adapter,
            event_tx,
            pending_auth: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            fixed_passkey: parking_lot::Mutex::new(None),
            adv_handle: Mutex::new(None),
            app_handles: Mutex::new(Vec::new()),
            agent_handle: Mutex::new(None),
        })
    }

    /// Register the pairing agent. Each request is forwarded as an [`AuthEvent`] and
    /// completed when the policy answers through [`Transport`].
    async fn register_agent(&self) -> Result<(), TransportError> {
        let passkey_tx = self.event_tx.clone();
        let passkey_pending = self.pending_auth.clone();
        let confirm_tx = self.event_tx.clone();
        let confirm_pending = self.pending_auth.clone();
        let authorize_tx = self.event_tx.clone();
        let authorize_pending = self.pending_auth.clone();
        let display_tx = self.event_tx.clone();

        let agent = Agent {
            request_default: true,
            request_passkey: Some(Box::new(move |req: RequestPasskey| {
                let tx = passkey_tx.clone();
                let pending = passkey_pending.clone();
                async move {
                    let peer = peer_of(req.device);
                    match Self::ask(&tx, &pending, req.device, AuthEvent::PasskeyEntry { peer })
                        .await
                    {
                        Ok(AgentAnswer::Passkey(passkey)) => Ok(passkey),
                        Ok(AgentAnswer::Confirm) => Err(AgentReqError::Rejected),
                        Err(e) => Err(e),
                    }
                }.boxed()
            })),
            display_passkey: Some(Box::new(move |req: DisplayPasskey| {
                let tx = display_tx.clone();
                async move {
                    let _ = tx
                        .send(TransportEvent::Auth(AuthEvent::PasskeyDisplay {
                            peer: peer_of(req.device),
                            passkey: req.passkey,
                        }))
                        .await;
                    Ok::<(), AgentReqError>(())
                }.boxed()
            })),
            request_confirmation: Some(Box::new(move |req: RequestConfirmation| {
                let tx = confirm_tx.clone();
                let pending = confirm_pending.clone();
                async move {
                    let event = AuthEvent::PasskeyConfirm {
                        peer: peer_of(req.device),
                        passkey: req.passkey,
                    };
                    Self::ask(&tx, &pending, req.device, event).await.map(|_| ())
                }.boxed()
            })),
            request_authorization: Some(Box::new(move |req: RequestAuthorization| {
                let tx = authorize_tx.clone();
                let pending = authorize_pending.clone();
                async move {
                    let event = AuthEvent::PairingConfirm {
                        peer: peer_of(req.device),
                    };
                    Self::ask(&tx, &pending, req.device, event).await.map(|_| ())
                }.boxed()
            })),
            ..Default::default()
        };

        *self.agent_handle.lock().await = Some(self.session.register_agent(agent).await?);
        info!("Pairing agent registered");
        Ok(())
    }

    /// Forward `event` and wait for the policy's answer.
    async fn ask(
        tx: &mpsc::Sender<TransportEvent>,
        pending: &PendingAuth,
        device: Address,
        event: AuthEvent,
    ) -> Result<AgentAnswer, AgentReqError> {
        let (answer_tx, answer_rx) = oneshot::channel();
        pending.lock().insert(device, answer_tx);

        if tx.send(TransportEvent::Auth(event)).await.is_err() {
            pending.lock().remove(&device);
            return Err(AgentReqError::Canceled);
        }

        match answer_rx.await {
            Ok(answer) => Ok(answer),
            Err(_) => {
                let _ = tx
                    .send(TransportEvent::Auth(AuthEvent::Cancel {
                        peer: peer_of(device),
                    }))
                    .await;
                Err(AgentReqError::Canceled)
            }
        }
    }

    fn answer(&self, peer: PeerAddress, answer: AgentAnswer) -> Result<(), TransportError> {
        let sender = self
            .pending_auth
            .lock()
            .remove(&Address(peer.bytes))
            .ok_or(TransportError::NotConnected(peer))?;
        sender
            .send(answer)
            .map_err(|_| TransportError::NotConnected(peer))
    }

    /// Report connection property changes of every device, cached ones included.
    async fn start_device_monitor(&self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone();
        let event_tx = self.event_tx.clone();
        // Subscribe first so a device added while listing is not missed.
        let events = self.adapter.events().await?;
        let known = self.adapter.device_addresses().await?;

        tokio::spawn(async move {
            info!("Starting BlueZ device monitor...");
            let mut watched = WatchedDevices::default();
            for addr in known {
                if watched.claim(addr) {
                    Self::spawn_watch(adapter.clone(), addr, event_tx.clone());
                }
            }

            pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) if watched.claim(addr) => {
                        Self::spawn_watch(adapter.clone(), addr, event_tx.clone());
                    }
                    AdapterEvent::DeviceRemoved(addr) => watched.release(addr),
                    _ => {}
                }
            }
            info!("BlueZ device monitor exited");
        });
        Ok(())
    }

    fn spawn_watch(adapter: Adapter, addr: Address, event_tx: mpsc::Sender<TransportEvent>) {
        tokio::spawn(async move {
            if let Err(e) = Self::watch_device(adapter, addr, event_tx).await {
                debug!("Stopped watching {}: {}", addr, e);
            }
        });
    }

    async fn watch_device(
        adapter: Adapter,
        addr: Address,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> bluer::Result<()> {
        let device = adapter.device(addr)?;
        let events = device.events().await?;
        pin_mut!(events);

        // A connection made before the subscription produces no property change.
        if device.is_connected().await?
            && event_tx.send(connection_event(addr, true)).await.is_err()
        {
            return Ok(());
        }

        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            if let DeviceProperty::Connected(connected) = property {
                if event_tx.send(connection_event(addr, connected)).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn characteristic(&self, uuid: u16, properties: Properties, value_handle: u16) -> Characteristic {
        let read_tx = self.event_tx.clone();
        let write_tx = self.event_tx.clone();
        let (_control, control_handle) = characteristic_control();

        Characteristic {
            uuid: uuid16(uuid),
            read: properties.contains(Properties::READ).then(|| CharacteristicRead {
                read: true,
                fun: Box::new(move |req: CharacteristicReadRequest| {
                    let tx = read_tx.clone();
                    async move {
                        let (reply, rx) = oneshot::channel();
                        let request = TransportEvent::Read {
                            peer: peer_of(req.device_address),
                            handle: value_handle,
                            offset: req.offset,
                            max_len: usize::from(req.mtu.saturating_sub(1)),
                            reply,
                        };
                        if tx.send(request).await.is_err() {
                            return Err(ReqError::Failed);
                        }
                        match rx.await {
                            Ok(result) => result.map_err(att_to_req),
                            Err(_) => Err(ReqError::Failed),
                        }
                    }.boxed()
                }),
                ..Default::default()
            }),
            write: properties.contains(Properties::WRITE).then(|| CharacteristicWrite {
                write: true,
                write_without_response: properties.contains(Properties::WRITE_WITHOUT_RESP),
                method: CharacteristicWriteMethod::Fun(Box::new(
                    move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                        let tx = write_tx.clone();
                        async move {
                            let (reply, rx) = oneshot::channel();
                            let request = TransportEvent::Write {
                                peer: peer_of(req.device_address),
                                handle: value_handle,
                                offset: req.offset,
                                data,
                                flags: WriteFlags {
                                    prepare: req.prepare_authorize,
                                    command: matches!(req.op_type, WriteOp::Command),
                                },
                                reply,
                            };
                            if tx.send(request).await.is_err() {
                                return Err(ReqError::Failed);
                            }
                            match rx.await {
                                Ok(result) => result.map(|_| ()).map_err(att_to_req),
                                Err(_) => Err(ReqError::Failed),
                            }
                        }.boxed()
                    },
                )),
                ..Default::default()
            }),
            notify: (properties.contains(Properties::NOTIFY)
                || properties.contains(Properties::INDICATE))
            .then(|| CharacteristicNotify {
                notify: properties.contains(Properties::NOTIFY),
                indicate: properties.contains(Properties::INDICATE),
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    async move {
                        debug!("Notification session on 0x{:04x} started", value_handle);
                        notifier.stopped().await;
                        debug!("Notification session on 0x{:04x} ended", value_handle);
                    }.boxed()
                })),
                ..Default::default()
            }),
            control_handle,
            ..Default::default()
        }
    }

    /// Minimal heart-rate service so subscription changes can be observed.
    async fn serve_heart_rate(&self) -> Result<(), TransportError> {
        let event_tx = self.event_tx.clone();
        let measurement = Characteristic {
            uuid: uuid16(HEART_RATE_MEASUREMENT_UUID16),
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let tx = event_tx.clone();
                    async move {
                        let _ = tx
                            .send(TransportEvent::NotifySubscription { enabled: true })
                            .await;
                        notifier.stopped().await;
                        let _ = tx
                            .send(TransportEvent::NotifySubscription { enabled: false })
                            .await;
                    }.boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: uuid16(HEART_RATE_SERVICE_UUID16),
                primary: true,
                characteristics: vec![measurement],
                ..Default::default()
            }],
            ..Default::default()
        };
        let handle = self.adapter.serve_gatt_application(app).await?;
        self.app_handles.lock().await.push(handle);
        Ok(())
    }
}

impl BluezTransport {
    async fn power_on(&self) -> Result<(), TransportError> {
        if !self.adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            self.adapter.set_powered(true).await?;
        }
        self.register_agent().await?;
        self.serve_heart_rate().await?;
        self.start_device_monitor().await
    }

    async fn local_identity(&self) -> Result<PeerAddress, TransportError> {
        let address = self.adapter.address().await?;
        let kind = match self.adapter.address_type().await? {
            AddressType::LeRandom => AddressKind::Random,
            _ => AddressKind::Public,
        };
        Ok(PeerAddress::new(address.0, kind))
    }

    async fn remove_bonds(&self, peer: Option<PeerAddress>) -> Result<(), TransportError> {
        match peer {
            Some(peer) => self.adapter.remove_device(Address(peer.bytes)).await?,
            None => {
                for addr in self.adapter.device_addresses().await? {
                    let device = self.adapter.device(addr)?;
                    if device.is_paired().await? {
                        debug!("Removing bond with {}", addr);
                        self.adapter.remove_device(addr).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn advertise(
        &self,
        params: &AdvertisingParams,
        payload: &AdvertisingPayload,
    ) -> Result<(), TransportError> {
        let adv = Advertisement {
            advertisement_type: if params.connectable {
                AdvertisementType::Peripheral
            } else {
                AdvertisementType::Broadcast
            },
            service_uuids: payload.service_uuids().iter().map(|u| uuid16(*u)).collect(),
            local_name: params.scannable.then(|| payload.device_name().to_string()),
            discoverable: Some(true),
            min_interval: Some(Duration::from_micros(u64::from(params.interval_min) * 625)),
            max_interval: Some(Duration::from_micros(u64::from(params.interval_max) * 625)),
            ..Default::default()
        };

        let mut adv_handle = self.adv_handle.lock().await;
        // Release the previous registration before asking for a new one.
        drop(adv_handle.take());
        match self.adapter.advertise(adv).await {
            Ok(handle) => {
                *adv_handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("BlueZ rejected advertisement: {}", e);
                Err(e.into())
            }
        }
    }

    async fn serve_service(&self, service: &RegisteredService) -> Result<(), TransportError> {
        let mut characteristics = Vec::new();
        for attribute in &service.attributes {
            match attribute.kind {
                AttributeKind::Characteristic {
                    uuid,
                    properties,
                    value_handle,
                } => characteristics.push(self.characteristic(uuid, properties, value_handle)),
                AttributeKind::Include {
                    service: included, ..
                } => {
                    warn!(
                        "BlueZ applications cannot express includes; 0x{:04x} is served without its reference to 0x{:04x}",
                        service.uuid, included
                    );
                }
                _ => {}
            }
        }

        let app = Application {
            services: vec![Service {
                uuid: uuid16(service.uuid),
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };
        let handle = self.adapter.serve_gatt_application(app).await?;
        self.app_handles.lock().await.push(handle);
        debug!("Service 0x{:04x} served by BlueZ", service.uuid);
        Ok(())
    }
}

impl Transport for BluezTransport {
    fn enable(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.power_on())
    }

    fn identity(&self) -> BoxFuture<'_, Result<PeerAddress, TransportError>> {
        Box::pin(self.local_identity())
    }

    fn unpair(&self, peer: Option<PeerAddress>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.remove_bonds(peer))
    }

    fn update_conn_params(
        &self,
        peer: PeerAddress,
        params: ConnParams,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            debug!("BlueZ cannot request {:?} for {}", params, peer);
            Err(TransportError::Unsupported)
        })
    }

    fn start_advertising<'a>(
        &'a self,
        params: &'a AdvertisingParams,
        payload: &'a AdvertisingPayload,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.advertise(params, payload))
    }

    fn register_service<'a>(
        &'a self,
        service: &'a RegisteredService,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.serve_service(service))
    }

    fn set_fixed_passkey(&self, passkey: Option<u32>) -> BoxFuture<'_, Result<(), TransportError>> {
        *self.fixed_passkey.lock() = passkey;
        Box::pin(async { Ok(()) })
    }

    fn passkey_entry(
        &self,
        peer: PeerAddress,
        passkey: u32,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let passkey = self.fixed_passkey.lock().unwrap_or(passkey);
        let result = self.answer(peer, AgentAnswer::Passkey(passkey));
        Box::pin(async move { result })
    }

    fn passkey_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self.answer(peer, AgentAnswer::Confirm);
        Box::pin(async move { result })
    }

    fn pairing_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self.answer(peer, AgentAnswer::Confirm);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTRAL: Address = Address([0xC0, 0x01, 0x02, 0x03, 0x04, 0xAB]);

    #[test]
    fn test_cached_device_is_watched_once() {
        let mut watched = WatchedDevices::default();

        // Listed at boot, then reported again by the adapter stream.
        assert!(watched.claim(CENTRAL));
        assert!(!watched.claim(CENTRAL));

        watched.release(CENTRAL);
        assert!(watched.claim(CENTRAL));
    }

    #[test]
    fn test_connection_event_mapping() {
        let peer = peer_of(CENTRAL);
        assert!(matches!(
            connection_event(CENTRAL, true),
            TransportEvent::Connected { peer: p, status: hci::SUCCESS } if p == peer
        ));
        assert!(matches!(
            connection_event(CENTRAL, false),
            TransportEvent::Disconnected { peer: p, reason: hci::REMOTE_USER_TERMINATED } if p == peer
        ));
    }
}
