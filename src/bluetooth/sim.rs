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

//! In-process simulated host stack and a scripted fuzzing central.
//!
//! [`SimTransport`] records every request made to the stack and can be told to
//! fail selected operations. [`SimCentral`] plays the remote side: it connects,
//! pairs, writes random long values in random fragments, reads them back and
//! disconnects, once per advertising cycle.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use super::advertiser::AdvertisingPayload;
use super::attribute_store::AttError;
use super::ble_constants::{config, CUSTOM_VALUE_CAPACITY};
use super::catalog::RegisteredService;
use super::hci;
use super::transport::{
    AddressKind, AdvertisingParams, AuthEvent, ConnParams, PeerAddress, Transport,
    TransportError, TransportEvent, WriteFlags,
};

/// A request observed by [`SimTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Enable,
    Identity,
    Unpair(Option<PeerAddress>),
    UpdateConnParams(PeerAddress, ConnParams),
    StartAdvertising { ad: Vec<u8>, sd: Vec<u8> },
    RegisterService(u16),
    SetFixedPasskey(Option<u32>),
    PasskeyEntry(PeerAddress, u32),
    PasskeyConfirm(PeerAddress),
    PairingConfirm(PeerAddress),
}

/// Operations [`SimTransport`] should reject.
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    pub enable: bool,
    /// Reject every advertising start from this attempt (zero based) on.
    pub advertising_from: Option<usize>,
    pub unpair: bool,
    pub conn_params: bool,
    pub register: bool,
    pub auth_replies: bool,
}

/// Recording host stack.
pub struct SimTransport {
    identity: PeerAddress,
    failures: FailurePlan,
    calls: Mutex<Vec<TransportCall>>,
    advertising_attempts: AtomicUsize,
    advertising_starts: AtomicUsize,
    advertising: Notify,
}

impl SimTransport {
    pub const IDENTITY: PeerAddress =
        PeerAddress::new([0xF0, 0x0D, 0xCA, 0xFE, 0x00, 0x01], AddressKind::Random);

    pub fn new() -> Self {
        Self::with_failures(FailurePlan::default())
    }

    pub fn with_failures(failures: FailurePlan) -> Self {
        Self {
            identity: Self::IDENTITY,
            failures,
            calls: Mutex::new(Vec::new()),
            advertising_attempts: AtomicUsize::new(0),
            advertising_starts: AtomicUsize::new(0),
            advertising: Notify::new(),
        }
    }

    /// Every request made so far, oldest first.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Number of accepted advertising starts.
    pub fn advertising_starts(&self) -> usize {
        self.advertising_starts.load(Ordering::Acquire)
    }

    /// Wait until at least `n` advertising starts have been accepted.
    pub async fn wait_for_advertising(&self, n: usize) {
        loop {
            let notified = self.advertising.notified();
            if self.advertising_starts() >= n {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, call: TransportCall) {
        debug!("sim stack: {:?}", call);
        self.calls.lock().push(call);
    }

    fn outcome(failed: bool) -> Result<(), TransportError> {
        if failed {
            Err(TransportError::Rejected("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn enable(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::Enable);
            if self.failures.enable {
                return Err(TransportError::NotReady);
            }
            Ok(())
        })
    }

    fn identity(&self) -> BoxFuture<'_, Result<PeerAddress, TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::Identity);
            Ok(self.identity)
        })
    }

    fn unpair(&self, peer: Option<PeerAddress>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::Unpair(peer));
            Self::outcome(self.failures.unpair)
        })
    }

    fn update_conn_params(
        &self,
        peer: PeerAddress,
        params: ConnParams,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::UpdateConnParams(peer, params));
            Self::outcome(self.failures.conn_params)
        })
    }

    fn start_advertising<'a>(
        &'a self,
        _params: &'a AdvertisingParams,
        payload: &'a AdvertisingPayload,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::StartAdvertising {
                ad: payload.ad().to_vec(),
                sd: payload.sd().to_vec(),
            });
            let attempt = self.advertising_attempts.fetch_add(1, Ordering::AcqRel);
            if self.failures.advertising_from.is_some_and(|n| attempt >= n) {
                return Err(TransportError::Rejected("advertising set busy".to_string()));
            }
            self.advertising_starts.fetch_add(1, Ordering::AcqRel);
            self.advertising.notify_waiters();
            Ok(())
        })
    }

    fn register_service<'a>(
        &'a self,
        service: &'a RegisteredService,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::RegisterService(service.uuid));
            Self::outcome(self.failures.register)
        })
    }

    fn set_fixed_passkey(&self, passkey: Option<u32>) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::SetFixedPasskey(passkey));
            Ok(())
        })
    }

    fn passkey_entry(
        &self,
        peer: PeerAddress,
        passkey: u32,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::PasskeyEntry(peer, passkey));
            Self::outcome(self.failures.auth_replies)
        })
    }

    fn passkey_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::PasskeyConfirm(peer));
            Self::outcome(self.failures.auth_replies)
        })
    }

    fn pairing_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.record(TransportCall::PairingConfirm(peer));
            Self::outcome(self.failures.auth_replies)
        })
    }
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("peripheral stopped accepting events")]
    Closed,
    #[error("peripheral dropped the request without replying")]
    NoReply,
}

/// What a [`SimCentral`] session did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub cycles: usize,
    pub bytes_written: usize,
    pub fragments: usize,
    pub rejected_writes: usize,
    /// Read-backs that did not match what was written.
    pub mismatches: usize,
}

/// Scripted remote central driving a [`SimTransport`] peripheral.
pub struct SimCentral {
    events: mpsc::Sender<TransportEvent>,
    transport: Arc<SimTransport>,
    peer: PeerAddress,
    value_handle: u16,
    max_fragment: usize,
    rng: StdRng,
}

impl SimCentral {
    pub const PEER: PeerAddress =
        PeerAddress::new([0xC4, 0x7A, 0x11, 0x00, 0xBE, 0xEF], AddressKind::Random);

    pub fn new(
        events: mpsc::Sender<TransportEvent>,
        transport: Arc<SimTransport>,
        value_handle: u16,
        seed: u64,
    ) -> Self {
        Self {
            events,
            transport,
            peer: Self::PEER,
            value_handle,
            max_fragment: usize::from(config::DEFAULT_MTU) - 5,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Largest fragment of a long write.
    pub fn max_fragment(mut self, max_fragment: usize) -> Self {
        self.max_fragment = max_fragment.max(1);
        self
    }

    async fn send(&self, event: TransportEvent) -> Result<(), SimError> {
        self.events.send(event).await.map_err(|_| SimError::Closed)
    }

    pub async fn connect(&self, status: u8) -> Result<(), SimError> {
        self.send(TransportEvent::Connected {
            peer: self.peer,
            status,
        })
        .await
    }

    pub async fn disconnect(&self, reason: u8) -> Result<(), SimError> {
        self.send(TransportEvent::Disconnected {
            peer: self.peer,
            reason,
        })
        .await
    }

    pub async fn subscribe(&self, enabled: bool) -> Result<(), SimError> {
        self.send(TransportEvent::NotifySubscription { enabled })
            .await
    }

    /// Raise one randomly chosen authentication request.
    pub async fn authenticate(&mut self) -> Result<(), SimError> {
        let peer = self.peer;
        let event = match self.rng.gen_range(0..5) {
            0 => AuthEvent::PasskeyEntry { peer },
            1 => AuthEvent::PasskeyConfirm {
                peer,
                passkey: self.rng.gen_range(0..1_000_000),
            },
            2 => AuthEvent::PairingConfirm { peer },
            3 => AuthEvent::PasskeyDisplay {
                peer,
                passkey: self.rng.gen_range(0..1_000_000),
            },
            _ => AuthEvent::Cancel { peer },
        };
        self.send(TransportEvent::Auth(event)).await
    }

    pub async fn write(
        &self,
        handle: u16,
        offset: u16,
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<Result<usize, AttError>, SimError> {
        let (reply, rx) = oneshot::channel();
        self.send(TransportEvent::Write {
            peer: self.peer,
            handle,
            offset,
            data: data.to_vec(),
            flags,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SimError::NoReply)
    }

    pub async fn read(
        &self,
        handle: u16,
        offset: u16,
        max_len: usize,
    ) -> Result<Result<Vec<u8>, AttError>, SimError> {
        let (reply, rx) = oneshot::channel();
        self.send(TransportEvent::Read {
            peer: self.peer,
            handle,
            offset,
            max_len,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SimError::NoReply)
    }

    /// Write `data` from offset zero in randomly sized fragments. Returns the
    /// number of fragments sent.
    pub async fn write_long(&mut self, data: &[u8]) -> Result<usize, SimError> {
        let mut offset = 0;
        let mut fragments = 0;
        while offset < data.len() {
            let len = self.rng.gen_range(1..=self.max_fragment).min(data.len() - offset);
            let flags = WriteFlags {
                prepare: data.len() > self.max_fragment,
                command: false,
            };
            if let Err(e) = self
                .write(self.value_handle, offset as u16, &data[offset..offset + len], flags)
                .await?
            {
                warn!("Fragment at offset {} rejected: {}", offset, e);
                break;
            }
            offset += len;
            fragments += 1;
        }
        Ok(fragments)
    }

    /// Read `len` bytes from offset zero, one MTU-sized read at a time.
    pub async fn read_long(&self, len: usize) -> Result<Vec<u8>, SimError> {
        let chunk = usize::from(config::DEFAULT_MTU) - 1;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            match self.read(self.value_handle, out.len() as u16, chunk).await? {
                Ok(bytes) if bytes.is_empty() => break,
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => {
                    warn!("Read at offset {} rejected: {}", out.len(), e);
                    break;
                }
            }
        }
        out.truncate(len);
        Ok(out)
    }

    /// Run `cycles` connection cycles, each started once the peripheral is
    /// advertising again, then wait for the final re-advertise.
    pub async fn run(&mut self, cycles: usize, reason: u8) -> Result<SessionReport, SimError> {
        let mut report = SessionReport::default();

        for cycle in 0..cycles {
            self.transport.wait_for_advertising(cycle + 1).await;
            info!("Central: starting cycle {}", cycle + 1);

            self.connect(hci::SUCCESS).await?;
            self.authenticate().await?;
            self.subscribe(true).await?;

            let len = self.rng.gen_range(1..=CUSTOM_VALUE_CAPACITY);
            let mut value = vec![0u8; len];
            self.rng.fill(&mut value[..]);
            report.fragments += self.write_long(&value).await?;
            report.bytes_written += len;

            let back = self.read_long(CUSTOM_VALUE_CAPACITY).await?;
            if back.len() != CUSTOM_VALUE_CAPACITY
                || back[..len] != value[..]
                || back[len..].iter().any(|b| *b != 0)
            {
                warn!("Central: read-back mismatch after writing {} bytes", len);
                report.mismatches += 1;
            }

            let overrun = self.rng.gen_range(1..=16);
            let offset = self.rng.gen_range(CUSTOM_VALUE_CAPACITY - 32..=CUSTOM_VALUE_CAPACITY);
            let junk = vec![0xA5; CUSTOM_VALUE_CAPACITY - offset + overrun];
            match self
                .write(self.value_handle, offset as u16, &junk, WriteFlags::default())
                .await?
            {
                Err(AttError::InvalidOffset) => report.rejected_writes += 1,
                other => {
                    warn!("Central: out-of-bounds write was not rejected: {:?}", other);
                    report.mismatches += 1;
                }
            }

            self.subscribe(false).await?;
            self.disconnect(reason).await?;
            report.cycles += 1;
        }

        self.transport.wait_for_advertising(cycles + 1).await;
        info!(
            "Central: {} cycles, {} bytes in {} fragments, {} rejected, {} mismatches",
            report.cycles,
            report.bytes_written,
            report.fragments,
            report.rejected_writes,
            report.mismatches
        );
        Ok(report)
    }
}
