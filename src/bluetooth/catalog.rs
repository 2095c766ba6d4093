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

//! GATT service declarations and handle allocation.
//!
//! Services are declared as typed attribute descriptors. The catalog assigns
//! handles in ascending order, hands the finished layout to the stack and keeps a
//! snapshot for diagnostics.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::ble_constants::{
    CCC_UUID16, CHARACTERISTIC_UUID16, CUSTOM_CHAR_UUID16, CUSTOM_SERVICE_UUID16,
    INCLUDE_UUID16, PRIMARY_SERVICE_UUID16,
};
use super::error::PeripheralError;
use super::transport::{Transport, TransportError};

/// Characteristic properties, as carried in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Properties(u8);

impl Properties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESP: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Access permissions of a characteristic value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
}

/// One entry of a service declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeDescriptor {
    /// Characteristic declaration plus its value attribute.
    Characteristic {
        uuid: u16,
        properties: Properties,
        permissions: Permissions,
    },
    Descriptor { uuid: u16 },
    /// Reference to an already registered service.
    Include { service: u16 },
}

/// A primary service and its attributes, before handles are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDeclaration {
    pub uuid: u16,
    pub attributes: Vec<AttributeDescriptor>,
}

impl ServiceDeclaration {
    /// The fuzz service: one characteristic that can be read, written, notified and
    /// indicated, followed by its client configuration descriptor.
    pub fn custom() -> Self {
        Self {
            uuid: CUSTOM_SERVICE_UUID16,
            attributes: vec![
                AttributeDescriptor::Characteristic {
                    uuid: CUSTOM_CHAR_UUID16,
                    properties: Properties::READ
                        .union(Properties::WRITE)
                        .union(Properties::INDICATE)
                        .union(Properties::NOTIFY),
                    permissions: Permissions {
                        read: true,
                        write: true,
                    },
                },
                AttributeDescriptor::Descriptor { uuid: CCC_UUID16 },
            ],
        }
    }

    fn handle_count(&self) -> u32 {
        1 + self
            .attributes
            .iter()
            .map(|a| match a {
                AttributeDescriptor::Characteristic { .. } => 2,
                AttributeDescriptor::Descriptor { .. } | AttributeDescriptor::Include { .. } => 1,
            })
            .sum::<u32>()
    }
}

/// An attribute with its handle assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    PrimaryService {
        uuid: u16,
    },
    Characteristic {
        uuid: u16,
        properties: Properties,
        value_handle: u16,
    },
    CharacteristicValue {
        uuid: u16,
        permissions: Permissions,
    },
    Descriptor {
        uuid: u16,
    },
    Include {
        service: u16,
        start_handle: u16,
        end_handle: u16,
    },
}

impl AttributeKind {
    /// Attribute type, as reported by attribute enumeration.
    pub fn type_uuid(&self) -> u16 {
        match self {
            AttributeKind::PrimaryService { .. } => PRIMARY_SERVICE_UUID16,
            AttributeKind::Characteristic { .. } => CHARACTERISTIC_UUID16,
            AttributeKind::CharacteristicValue { uuid, .. } => *uuid,
            AttributeKind::Descriptor { uuid } => *uuid,
            AttributeKind::Include { .. } => INCLUDE_UUID16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    pub kind: AttributeKind,
}

/// A service whose handles are allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub uuid: u16,
    pub start_handle: u16,
    pub end_handle: u16,
    pub attributes: Vec<Attribute>,
}

impl RegisteredService {
    /// Handle of the value attribute of characteristic `uuid`.
    pub fn value_handle(&self, uuid: u16) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a.kind {
            AttributeKind::CharacteristicValue { uuid: u, .. } if u == uuid => Some(a.handle),
            _ => None,
        })
    }
}

/// Registry of every service this peripheral exposes.
pub struct ServiceCatalog {
    transport: Arc<dyn Transport>,
    services: Vec<RegisteredService>,
    next_handle: u32,
}

impl ServiceCatalog {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            services: Vec::new(),
            next_handle: 0x0001,
        }
    }

    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    pub fn service(&self, uuid: u16) -> Option<&RegisteredService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// Allocate handles for `declaration` and register it with the stack.
    pub async fn register(
        &mut self,
        declaration: ServiceDeclaration,
    ) -> Result<&RegisteredService, PeripheralError> {
        let service = self.allocate(&declaration)?;

        self.transport
            .register_service(&service)
            .await
            .map_err(|e| PeripheralError::Registration {
                uuid: declaration.uuid,
                source: e,
            })?;

        info!(
            "Registered service 0x{:04x} at handles 0x{:04x}-0x{:04x}",
            service.uuid, service.start_handle, service.end_handle
        );
        self.next_handle = u32::from(service.end_handle) + 1;
        self.services.push(service);
        Ok(&self.services[self.services.len() - 1])
    }

    /// Register a service whose only content is a reference to `included`.
    pub async fn register_inclusion(
        &mut self,
        uuid: u16,
        included: u16,
    ) -> Result<&RegisteredService, PeripheralError> {
        self.register(ServiceDeclaration {
            uuid,
            attributes: vec![AttributeDescriptor::Include { service: included }],
        })
        .await
    }

    fn allocate(&self, declaration: &ServiceDeclaration) -> Result<RegisteredService, PeripheralError> {
        let start = self.next_handle;
        let end = start + declaration.handle_count() - 1;
        if end > u32::from(u16::MAX) {
            return Err(PeripheralError::Registration {
                uuid: declaration.uuid,
                source: TransportError::HandlesExhausted,
            });
        }

        let mut handle = start as u16;
        let mut attributes = vec![Attribute {
            handle,
            kind: AttributeKind::PrimaryService {
                uuid: declaration.uuid,
            },
        }];

        for descriptor in &declaration.attributes {
            handle += 1;
            match *descriptor {
                AttributeDescriptor::Characteristic {
                    uuid,
                    properties,
                    permissions,
                } => {
                    attributes.push(Attribute {
                        handle,
                        kind: AttributeKind::Characteristic {
                            uuid,
                            properties,
                            value_handle: handle + 1,
                        },
                    });
                    handle += 1;
                    attributes.push(Attribute {
                        handle,
                        kind: AttributeKind::CharacteristicValue { uuid, permissions },
                    });
                }
                AttributeDescriptor::Descriptor { uuid } => attributes.push(Attribute {
                    handle,
                    kind: AttributeKind::Descriptor { uuid },
                }),
                AttributeDescriptor::Include { service } => {
                    let target = self.service(service).ok_or(PeripheralError::Dependency {
                        uuid: declaration.uuid,
                        missing: service,
                    })?;
                    attributes.push(Attribute {
                        handle,
                        kind: AttributeKind::Include {
                            service,
                            start_handle: target.start_handle,
                            end_handle: target.end_handle,
                        },
                    });
                }
            }
        }

        debug!(
            "Allocated {} handles for service 0x{:04x}",
            attributes.len(),
            declaration.uuid
        );
        Ok(RegisteredService {
            uuid: declaration.uuid,
            start_handle: start as u16,
            end_handle: handle,
            attributes,
        })
    }

    /// `(handle, attribute type)` of every registered attribute in
    /// `start..=end`, in ascending handle order.
    pub fn enumerate(&self, start: u16, end: u16) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.services
            .iter()
            .flat_map(|s| s.attributes.iter())
            .filter(move |a| a.handle >= start && a.handle <= end)
            .map(|a| (a.handle, a.kind.type_uuid()))
    }

    /// Log every attribute in `start..=end`, pausing `delay` before each line.
    pub async fn log_attributes(&self, start: u16, end: u16, delay: Duration) {
        for (handle, uuid) in self.enumerate(start, end) {
            tokio::time::sleep(delay).await;
            info!("H: 0x{:04x}, U: {:04x}", handle, uuid);
        }
    }
}
