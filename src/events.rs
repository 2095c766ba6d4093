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

//! Transport event processing and dispatch.
//!
//! The dispatcher is the callback context: it drains the bounded event channel
//! filled by the host stack and invokes the connection, pairing and attribute
//! callbacks one event at a time.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bluetooth::{
    AttError, AttributeStore, ConnectionTracker, NotificationSubscription, PairingPolicy,
    TransportEvent,
};

/// Routes transport events to the peripheral callbacks.
pub struct EventDispatcher {
    tracker: Arc<ConnectionTracker>,
    policy: PairingPolicy,
    store: AttributeStore,
    heart_rate: NotificationSubscription,
    value_handle: Option<u16>,
}

impl EventDispatcher {
    /// Create a dispatcher serving the custom value at `value_handle`.
    pub fn new(
        tracker: Arc<ConnectionTracker>,
        policy: PairingPolicy,
        store: AttributeStore,
        value_handle: Option<u16>,
    ) -> Self {
        Self {
            tracker,
            policy,
            store,
            heart_rate: NotificationSubscription::new(),
            value_handle,
        }
    }

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    pub fn heart_rate(&self) -> &NotificationSubscription {
        &self.heart_rate
    }

    /// Process events until the stack closes the channel.
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) -> Self {
        debug!("Event dispatcher started");
        while let Some(event) = events.recv().await {
            self.process_event(event).await;
        }
        info!("Transport event channel closed");
        self
    }

    /// Process a single event.
    pub async fn process_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, status } => {
                self.tracker.on_connected(peer, status).await;
            }
            TransportEvent::Disconnected { peer, reason } => {
                self.tracker.on_disconnected(peer, reason).await;
            }
            TransportEvent::Auth(auth) => {
                self.policy.handle(auth).await;
            }
            TransportEvent::Read {
                peer,
                handle,
                offset,
                max_len,
                reply,
            } => {
                let result = self
                    .check_handle(handle)
                    .and_then(|()| self.store.read(usize::from(offset), max_len));
                match &result {
                    Ok(bytes) => debug!(
                        "Read from {}: handle 0x{:04x}, offset {}, {} bytes",
                        peer,
                        handle,
                        offset,
                        bytes.len()
                    ),
                    Err(e) => Self::log_rejection("read", peer, handle, offset, *e),
                }
                if reply.send(result).is_err() {
                    debug!("Read requester for handle 0x{:04x} went away", handle);
                }
            }
            TransportEvent::Write {
                peer,
                handle,
                offset,
                data,
                flags,
                reply,
            } => {
                debug!(
                    "Write from {}: handle 0x{:04x}, offset {}, {} bytes {:?}",
                    peer,
                    handle,
                    offset,
                    data.len(),
                    flags
                );
                debug!("Write data (hex): {}", hex::encode(&data));

                let result = self
                    .check_handle(handle)
                    .and_then(|()| self.store.write(usize::from(offset), &data));
                if let Err(e) = result {
                    Self::log_rejection("write", peer, handle, offset, e);
                }
                if reply.send(result).is_err() {
                    debug!("Write requester for handle 0x{:04x} went away", handle);
                }
            }
            TransportEvent::NotifySubscription { enabled } => {
                self.heart_rate.ntf_changed(enabled);
            }
        }
    }

    fn check_handle(&self, handle: u16) -> Result<(), AttError> {
        match self.value_handle {
            Some(h) if h == handle => Ok(()),
            _ => Err(AttError::InvalidHandle),
        }
    }

    fn log_rejection(
        op: &str,
        peer: impl std::fmt::Display,
        handle: u16,
        offset: u16,
        e: AttError,
    ) {
        warn!(
            "Rejected {} from {} at handle 0x{:04x} offset {}: {} (ATT 0x{:02x})",
            op,
            peer,
            handle,
            offset,
            e,
            e.code()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{SimTransport, TransportCall};
    use crate::bluetooth::transport::{AddressKind, AuthEvent, PeerAddress, WriteFlags};
    use crate::bluetooth::{hci, ConnectionState};
    use tokio::sync::oneshot;

    const PEER: PeerAddress = PeerAddress::new([0xCA, 0, 0, 0, 0, 0x07], AddressKind::Random);
    const VALUE_HANDLE: u16 = 0x0003;

    fn dispatcher() -> (Arc<SimTransport>, Arc<ConnectionTracker>, EventDispatcher) {
        let transport = Arc::new(SimTransport::new());
        let tracker = Arc::new(ConnectionTracker::new(transport.clone()));
        let dispatcher = EventDispatcher::new(
            tracker.clone(),
            PairingPolicy::new(transport.clone()),
            AttributeStore::new(),
            Some(VALUE_HANDLE),
        );
        (transport, tracker, dispatcher)
    }

    async fn write(
        dispatcher: &mut EventDispatcher,
        handle: u16,
        offset: u16,
        data: &[u8],
    ) -> Result<usize, AttError> {
        let (reply, rx) = oneshot::channel();
        dispatcher
            .process_event(TransportEvent::Write {
                peer: PEER,
                handle,
                offset,
                data: data.to_vec(),
                flags: WriteFlags::default(),
                reply,
            })
            .await;
        rx.await.unwrap()
    }

    async fn read(
        dispatcher: &mut EventDispatcher,
        handle: u16,
        offset: u16,
        max_len: usize,
    ) -> Result<Vec<u8>, AttError> {
        let (reply, rx) = oneshot::channel();
        dispatcher
            .process_event(TransportEvent::Read {
                peer: PEER,
                handle,
                offset,
                max_len,
                reply,
            })
            .await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_short_overwrite_reads_zero_tail() {
        let (_transport, _tracker, mut dispatcher) = dispatcher();

        assert_eq!(write(&mut dispatcher, VALUE_HANDLE, 0, &[0x42; 64]).await, Ok(64));
        assert_eq!(write(&mut dispatcher, VALUE_HANDLE, 0, &[0x24; 10]).await, Ok(10));

        assert_eq!(
            read(&mut dispatcher, VALUE_HANDLE, 20, 10).await,
            Ok(vec![0u8; 10])
        );
    }

    #[tokio::test]
    async fn test_overrun_write_is_rejected_with_invalid_offset() {
        let (_transport, _tracker, mut dispatcher) = dispatcher();

        assert_eq!(
            write(&mut dispatcher, VALUE_HANDLE, 500, &[0x01; 20]).await,
            Err(AttError::InvalidOffset)
        );
        assert_eq!(
            read(&mut dispatcher, VALUE_HANDLE, 0, 13).await,
            Ok(b"Initial value".to_vec())
        );
    }

    #[tokio::test]
    async fn test_unknown_handle_is_rejected() {
        let (_transport, _tracker, mut dispatcher) = dispatcher();

        assert_eq!(
            write(&mut dispatcher, 0x0009, 0, &[1, 2, 3]).await,
            Err(AttError::InvalidHandle)
        );
        assert_eq!(
            read(&mut dispatcher, 0x0001, 0, 4).await,
            Err(AttError::InvalidHandle)
        );
    }

    #[tokio::test]
    async fn test_lifecycle_and_auth_events_reach_callbacks() {
        let (transport, tracker, mut dispatcher) = dispatcher();

        dispatcher
            .process_event(TransportEvent::Connected {
                peer: PEER,
                status: hci::SUCCESS,
            })
            .await;
        dispatcher
            .process_event(TransportEvent::Auth(AuthEvent::PasskeyEntry { peer: PEER }))
            .await;
        dispatcher
            .process_event(TransportEvent::NotifySubscription { enabled: true })
            .await;
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert!(dispatcher.heart_rate().is_enabled());

        dispatcher
            .process_event(TransportEvent::Disconnected {
                peer: PEER,
                reason: hci::REMOTE_USER_TERMINATED,
            })
            .await;
        assert_eq!(tracker.state(), ConnectionState::DisconnectedPending);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::UpdateConnParams(PEER, crate::bluetooth::ConnParams::FIXED),
                TransportCall::PasskeyEntry(PEER, 0),
                TransportCall::Unpair(Some(PEER)),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_returns_on_channel_close() {
        let (_transport, _tracker, dispatcher) = dispatcher();
        let (tx, rx) = mpsc::channel(4);
        tx.send(TransportEvent::NotifySubscription { enabled: true })
            .await
            .unwrap();
        drop(tx);

        let dispatcher = dispatcher.run(rx).await;
        assert!(dispatcher.heart_rate().is_enabled());
        assert_eq!(dispatcher.store().capacity(), 512);
    }
}
