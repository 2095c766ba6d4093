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

//! Non-interactive pairing policy.
//!
//! **Test-only.** Every pairing request is accepted without operator input: passkey
//! entry is answered with the fixed passkey `000000`, numeric comparison is confirmed
//! without looking at the value and "just works" pairing is confirmed
//! unconditionally. This is what a fuzzing target needs and is not a secure default
//! for any other deployment.

use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::transport::{AuthEvent, PeerAddress, Transport};

/// Static passkey registered with the stack and answered on passkey entry.
pub const FIXED_PASSKEY: u32 = 0;

/// Always-accept authentication callbacks.
pub struct PairingPolicy {
    transport: Arc<dyn Transport>,
}

impl PairingPolicy {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Install the fixed passkey with the stack.
    pub async fn register(&self) {
        match self.transport.set_fixed_passkey(Some(FIXED_PASSKEY)).await {
            Ok(()) => debug!("Fixed passkey {:06} registered", FIXED_PASSKEY),
            Err(e) => warn!("Failed to set fixed passkey: {}", e),
        }
    }

    /// Route an authentication event to its callback.
    pub async fn handle(&self, event: AuthEvent) {
        match event {
            AuthEvent::Cancel { peer } => self.on_cancel(peer),
            AuthEvent::PasskeyEntry { peer } => self.on_passkey_entry(peer).await,
            AuthEvent::PasskeyConfirm { peer, passkey } => {
                self.on_passkey_confirm(peer, passkey).await
            }
            AuthEvent::PairingConfirm { peer } => self.on_pairing_confirm(peer).await,
            AuthEvent::PasskeyDisplay { peer, passkey } => self.on_passkey_display(peer, passkey),
        }
    }

    pub fn on_cancel(&self, peer: PeerAddress) {
        info!("Pairing cancelled: {}", peer);
    }

    pub async fn on_passkey_entry(&self, peer: PeerAddress) {
        info!("Passkey entry requested by {}", peer);
        if let Err(e) = self.transport.passkey_entry(peer, FIXED_PASSKEY).await {
            warn!("Failed to answer passkey entry for {}: {}", peer, e);
        }
    }

    /// The displayed value is not compared against anything.
    pub async fn on_passkey_confirm(&self, peer: PeerAddress, passkey: u32) {
        info!("Passkey confirmation requested by {} ({:06})", peer, passkey);
        if let Err(e) = self.transport.passkey_confirm(peer).await {
            warn!("Failed to confirm passkey for {}: {}", peer, e);
        }
    }

    pub async fn on_pairing_confirm(&self, peer: PeerAddress) {
        info!("Pairing confirmation requested by {}", peer);
        if let Err(e) = self.transport.pairing_confirm(peer).await {
            warn!("Failed to confirm pairing for {}: {}", peer, e);
        }
    }

    /// Nothing is shown to an operator.
    pub fn on_passkey_display(&self, peer: PeerAddress, passkey: u32) {
        trace!("Passkey {:06} for {} not displayed", passkey, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{FailurePlan, SimTransport, TransportCall};
    use crate::bluetooth::transport::AddressKind;

    const PEER: PeerAddress = PeerAddress::new([0xD1, 0, 0, 0, 0, 0x42], AddressKind::Random);

    #[tokio::test]
    async fn test_passkey_entry_answers_fixed_passkey() {
        let transport = Arc::new(SimTransport::new());
        let policy = PairingPolicy::new(transport.clone());

        policy.handle(AuthEvent::PasskeyEntry { peer: PEER }).await;

        assert_eq!(transport.calls(), vec![TransportCall::PasskeyEntry(PEER, 0)]);
    }

    #[tokio::test]
    async fn test_confirmations_ignore_displayed_value() {
        let transport = Arc::new(SimTransport::new());
        let policy = PairingPolicy::new(transport.clone());

        policy
            .handle(AuthEvent::PasskeyConfirm {
                peer: PEER,
                passkey: 123_456,
            })
            .await;
        policy.handle(AuthEvent::PairingConfirm { peer: PEER }).await;

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::PasskeyConfirm(PEER),
                TransportCall::PairingConfirm(PEER)
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_and_display_do_not_reach_stack() {
        let transport = Arc::new(SimTransport::new());
        let policy = PairingPolicy::new(transport.clone());

        policy.handle(AuthEvent::Cancel { peer: PEER }).await;
        policy
            .handle(AuthEvent::PasskeyDisplay {
                peer: PEER,
                passkey: 42,
            })
            .await;

        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reply_failure_is_not_retried() {
        let transport = Arc::new(SimTransport::with_failures(FailurePlan {
            auth_replies: true,
            ..Default::default()
        }));
        let policy = PairingPolicy::new(transport.clone());

        policy.handle(AuthEvent::PairingConfirm { peer: PEER }).await;

        assert_eq!(transport.calls(), vec![TransportCall::PairingConfirm(PEER)]);
    }

    #[tokio::test]
    async fn test_register_sets_zero_passkey() {
        let transport = Arc::new(SimTransport::new());
        PairingPolicy::new(transport.clone()).register().await;
        assert_eq!(transport.calls(), vec![TransportCall::SetFixedPasskey(Some(0))]);
    }
}
