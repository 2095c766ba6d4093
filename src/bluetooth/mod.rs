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

//! BLE peripheral policy layer.

pub mod advertiser;
pub mod attribute_store;
pub mod ble_constants;
pub mod catalog;
pub mod connection;
pub mod error;
#[cfg(feature = "bluez")]
pub mod gatt_server;
pub mod hci;
pub mod heart_rate;
pub mod pairing;
pub mod peripheral;
pub mod sim;
pub mod transport;

pub use advertiser::{AdvertiserController, AdvertisingError, AdvertisingPayload};
pub use attribute_store::{AttError, AttributeStore};
pub use catalog::{AttributeDescriptor, AttributeKind, ServiceCatalog, ServiceDeclaration};
pub use connection::{ConnectionState, ConnectionTracker, PendingEventFlags, PendingFlag};
pub use error::PeripheralError;
pub use heart_rate::NotificationSubscription;
pub use pairing::PairingPolicy;
pub use peripheral::{Peripheral, PeripheralSettings};
pub use transport::{
    AddressKind, AdvertisingParams, AuthEvent, ConnParams, PeerAddress, Transport,
    TransportError, TransportEvent, WriteFlags,
};
