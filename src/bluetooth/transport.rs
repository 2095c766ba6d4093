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

//! Boundary with the BLE host stack.
//!
//! The stack is an external collaborator. It pushes [`TransportEvent`]s onto a
//! bounded channel and exposes the few operations the policy layer needs through
//! the [`Transport`] trait.

use futures::future::BoxFuture;
use std::fmt;
use thiserror::Error;
use tokio::sync::oneshot;

use super::advertiser::AdvertisingPayload;
use super::attribute_store::AttError;
use super::ble_constants::config;
use super::catalog::RegisteredService;

/// Address type of a LE device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Public,
    Random,
}

/// A LE device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub bytes: [u8; 6],
    pub kind: AddressKind,
}

impl PeerAddress {
    pub const fn new(bytes: [u8; 6], kind: AddressKind) -> Self {
        Self { bytes, kind }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} ({})",
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5],
            match self.kind {
                AddressKind::Public => "public",
                AddressKind::Random => "random",
            }
        )
    }
}

/// Errors reported by the host stack.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth stack is not ready")]
    NotReady,
    #[error("peer {0} is not connected")]
    NotConnected(PeerAddress),
    #[error("operation not supported by this stack")]
    Unsupported,
    #[error("attribute handle space exhausted")]
    HandlesExhausted,
    #[error("request rejected by the stack: {0}")]
    Rejected(String),
}

/// Requested LE connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    /// 1.25 ms units.
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    /// 10 ms units.
    pub timeout: u16,
}

impl ConnParams {
    /// The parameter set requested after every successful connection.
    pub const FIXED: ConnParams = ConnParams {
        interval_min: config::CONN_INTERVAL_MIN,
        interval_max: config::CONN_INTERVAL_MAX,
        latency: config::CONN_LATENCY,
        timeout: config::CONN_SUPERVISION_TIMEOUT,
    };
}

/// Legacy advertising parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParams {
    pub connectable: bool,
    pub scannable: bool,
    /// 0.625 ms units.
    pub interval_min: u16,
    pub interval_max: u16,
}

impl AdvertisingParams {
    /// Connectable and scannable, fast interval 1.
    pub const CONN_FAST_1: AdvertisingParams = AdvertisingParams {
        connectable: true,
        scannable: true,
        interval_min: config::ADV_FAST_INTERVAL_MIN,
        interval_max: config::ADV_FAST_INTERVAL_MAX,
    };
}

/// Authentication requests raised by the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    Cancel { peer: PeerAddress },
    PasskeyEntry { peer: PeerAddress },
    PasskeyConfirm { peer: PeerAddress, passkey: u32 },
    PairingConfirm { peer: PeerAddress },
    PasskeyDisplay { peer: PeerAddress, passkey: u32 },
}

/// Flags attached to an attribute write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Prepare Write Request (first half of a queued long write).
    pub prepare: bool,
    /// Write Command, no response expected.
    pub command: bool,
}

pub type ReadReply = oneshot::Sender<Result<Vec<u8>, AttError>>;
pub type WriteReply = oneshot::Sender<Result<usize, AttError>>;

/// Events pushed by the stack, in the order it observed them.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection attempt finished. `status` is an HCI status code, zero on success.
    Connected { peer: PeerAddress, status: u8 },
    /// Connection ended. `reason` is an HCI error code.
    Disconnected { peer: PeerAddress, reason: u8 },
    Auth(AuthEvent),
    Read {
        peer: PeerAddress,
        handle: u16,
        offset: u16,
        max_len: usize,
        reply: ReadReply,
    },
    Write {
        peer: PeerAddress,
        handle: u16,
        offset: u16,
        data: Vec<u8>,
        flags: WriteFlags,
        reply: WriteReply,
    },
    /// Heart-rate measurement notifications were enabled or disabled.
    NotifySubscription { enabled: bool },
}

/// Operations the policy layer requests from the host stack.
pub trait Transport: Send + Sync {
    /// Bring the stack up. Resolves once it is ready for use.
    fn enable(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Local identity address.
    fn identity(&self) -> BoxFuture<'_, Result<PeerAddress, TransportError>>;

    /// Remove bonding information for `peer`, or for every bonded peer when `None`.
    fn unpair(&self, peer: Option<PeerAddress>) -> BoxFuture<'_, Result<(), TransportError>>;

    fn update_conn_params(
        &self,
        peer: PeerAddress,
        params: ConnParams,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    fn start_advertising<'a>(
        &'a self,
        params: &'a AdvertisingParams,
        payload: &'a AdvertisingPayload,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Expose a service whose handles have already been allocated.
    fn register_service<'a>(
        &'a self,
        service: &'a RegisteredService,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Static passkey used for every pairing, or `None` to clear it.
    fn set_fixed_passkey(&self, passkey: Option<u32>) -> BoxFuture<'_, Result<(), TransportError>>;

    fn passkey_entry(
        &self,
        peer: PeerAddress,
        passkey: u32,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    fn passkey_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>>;

    fn pairing_confirm(&self, peer: PeerAddress) -> BoxFuture<'_, Result<(), TransportError>>;
}
