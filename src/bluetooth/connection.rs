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

//! Connection lifecycle tracking.
//!
//! Connect and disconnect callbacks run in the dispatcher task. They record what
//! happened in [`PendingEventFlags`] and wake the main loop, which test-and-clears
//! the flags before acting. A flag that is set twice before it is drained is only
//! observed once, so a repeated disconnect never causes a second restart.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::hci;
use super::transport::{ConnParams, PeerAddress, Transport};

/// Lifecycle of the single tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connected = 1,
    /// Disconnected, waiting for the main loop to re-arm advertising.
    DisconnectedPending = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::DisconnectedPending,
            _ => ConnectionState::Idle,
        }
    }
}

/// Event flags handed from the callback context to the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PendingFlag {
    Connected = 1 << 0,
    Disconnected = 1 << 1,
}

/// Two independently settable flags in one atomic byte.
#[derive(Debug, Default)]
pub struct PendingEventFlags(AtomicU8);

impl PendingEventFlags {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Set `flag`, returning whether it was already set.
    pub fn set(&self, flag: PendingFlag) -> bool {
        let bit = flag as u8;
        self.0.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Clear `flag`, returning whether it was set.
    pub fn test_and_clear(&self, flag: PendingFlag) -> bool {
        let bit = flag as u8;
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn is_set(&self, flag: PendingFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u8 != 0
    }
}

/// Owner of [`ConnectionState`] and the pending flags.
pub struct ConnectionTracker {
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    flags: PendingEventFlags,
    signal: Notify,
}

impl ConnectionTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            flags: PendingEventFlags::new(),
            signal: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn flags(&self) -> &PendingEventFlags {
        &self.flags
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Connect callback. `status` is zero on success.
    pub async fn on_connected(&self, peer: PeerAddress, status: u8) {
        if status != hci::SUCCESS {
            info!(
                "Connection failed, err 0x{:02x} {}",
                status,
                hci::error_name(status)
            );
            return;
        }

        if self.state() == ConnectionState::Connected {
            warn!("Connect from {} while a connection is already tracked", peer);
        }

        info!("Connected: {}", peer);
        self.set_state(ConnectionState::Connected);
        self.flags.set(PendingFlag::Connected);

        if let Err(e) = self
            .transport
            .update_conn_params(peer, ConnParams::FIXED)
            .await
        {
            warn!("Connection parameter update for {} failed: {}", peer, e);
        }
    }

    /// Disconnect callback. Unpairs `peer` before the loop can observe the flag.
    pub async fn on_disconnected(&self, peer: PeerAddress, reason: u8) {
        info!(
            "Disconnected: {}, reason 0x{:02x} {}",
            peer,
            reason,
            hci::error_name(reason)
        );

        if let Err(e) = self.transport.unpair(Some(peer)).await {
            warn!("Failed to unpair {}: {}", peer, e);
        }

        self.set_state(ConnectionState::DisconnectedPending);
        if self.flags.set(PendingFlag::Disconnected) {
            debug!("Disconnect flag already pending");
        }
        self.signal.notify_one();
    }

    /// Wait for the next signal from the callback context.
    ///
    /// At most one signal is stored while nobody is waiting.
    pub async fn signalled(&self) {
        self.signal.notified().await;
    }

    /// Drain the connected flag. Informational only.
    pub fn take_connected(&self) -> bool {
        self.flags.test_and_clear(PendingFlag::Connected)
    }

    /// Drain the disconnected flag, moving back to [`ConnectionState::Idle`] if it was
    /// set. Returns whether advertising must be restarted.
    pub fn take_disconnected(&self) -> bool {
        if !self.flags.test_and_clear(PendingFlag::Disconnected) {
            return false;
        }
        // A reconnect may already have been accepted; only leave the pending state.
        let _ = self.state.compare_exchange(
            ConnectionState::DisconnectedPending as u8,
            ConnectionState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{FailurePlan, SimTransport, TransportCall};
    use crate::bluetooth::transport::AddressKind;
    use std::time::Duration;

    const PEER: PeerAddress = PeerAddress::new([0xE4, 1, 2, 3, 4, 5], AddressKind::Random);

    fn tracker() -> (Arc<SimTransport>, ConnectionTracker) {
        let transport = Arc::new(SimTransport::new());
        let tracker = ConnectionTracker::new(transport.clone());
        (transport, tracker)
    }

    #[test]
    fn test_flags_are_independent_and_idempotent() {
        let flags = PendingEventFlags::new();
        assert!(!flags.set(PendingFlag::Connected));
        assert!(flags.set(PendingFlag::Connected));
        assert!(!flags.is_set(PendingFlag::Disconnected));

        assert!(!flags.set(PendingFlag::Disconnected));
        assert!(flags.test_and_clear(PendingFlag::Disconnected));
        assert!(!flags.test_and_clear(PendingFlag::Disconnected));
        assert!(flags.is_set(PendingFlag::Connected));
    }

    #[tokio::test]
    async fn test_connect_success_requests_param_update() {
        let (transport, tracker) = tracker();

        tracker.on_connected(PEER, hci::SUCCESS).await;

        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert!(tracker.flags().is_set(PendingFlag::Connected));
        assert_eq!(
            transport.calls(),
            vec![TransportCall::UpdateConnParams(PEER, ConnParams::FIXED)]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_sets_nothing() {
        let (transport, tracker) = tracker();

        tracker
            .on_connected(PEER, hci::CONN_FAILED_TO_BE_ESTABLISHED)
            .await;

        assert_eq!(tracker.state(), ConnectionState::Idle);
        assert!(!tracker.flags().is_set(PendingFlag::Connected));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_param_update_failure_keeps_connection() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            conn_params: true,
            ..Default::default()
        }));
        let tracker = ConnectionTracker::new(transport.clone());

        tracker.on_connected(PEER, hci::SUCCESS).await;

        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert_eq!(transport.count(|c| matches!(c, TransportCall::UpdateConnParams(..))), 1);
    }

    #[tokio::test]
    async fn test_disconnect_unpairs_then_signals() {
        let (transport, tracker) = tracker();
        tracker.on_connected(PEER, hci::SUCCESS).await;

        tracker
            .on_disconnected(PEER, hci::REMOTE_USER_TERMINATED)
            .await;

        assert_eq!(tracker.state(), ConnectionState::DisconnectedPending);
        assert_eq!(
            transport.count(|c| *c == TransportCall::Unpair(Some(PEER))),
            1
        );
        tokio::time::timeout(Duration::from_secs(1), tracker.signalled())
            .await
            .expect("signal should be pending");

        assert!(tracker.take_disconnected());
        assert_eq!(tracker.state(), ConnectionState::Idle);
        assert!(!tracker.take_disconnected());
    }

    #[tokio::test]
    async fn test_double_disconnect_drains_once() {
        let (_transport, tracker) = tracker();
        tracker.on_connected(PEER, hci::SUCCESS).await;

        tracker.on_disconnected(PEER, hci::CONNECTION_TIMEOUT).await;
        tracker.on_disconnected(PEER, hci::CONNECTION_TIMEOUT).await;

        assert!(tracker.take_disconnected());
        assert!(!tracker.take_disconnected());
    }

    #[tokio::test]
    async fn test_unpair_failure_still_sets_flag() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            unpair: true,
            ..Default::default()
        }));
        let tracker = ConnectionTracker::new(transport.clone());

        tracker
            .on_disconnected(PEER, hci::REMOTE_USER_TERMINATED)
            .await;

        assert!(tracker.flags().is_set(PendingFlag::Disconnected));
    }
}
