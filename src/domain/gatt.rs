//! GATT Service Model
//!
//! One primary service holding one characteristic. The stored value is the
//! single "live" signal; dispatches overwrite it and nothing resets it.

use crate::domain::error::SessionError;
use crate::domain::models::{InboundWritePolicy, MessageSeverity, PeerId, SignalCode};
use crate::domain::platform::BlePlatform;
use crate::domain::session_log::SessionLog;
use crate::domain::protocol::{self, permission, property};
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(property::READ);
    pub const WRITE: Self = Self(property::WRITE);
    pub const NOTIFY: Self = Self(property::NOTIFY);

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::NOTIFY, "NOTIFY"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        write!(f, "{} [{}]", self.0, names.join("|"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicPermissions(u8);

impl CharacteristicPermissions {
    pub const READ: Self = Self(permission::READ);

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Static description of the service/characteristic pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    service_id: Uuid,
    characteristic_id: Uuid,
    properties: CharacteristicProperties,
    permissions: CharacteristicPermissions,
}

impl ServiceDescriptor {
    pub fn door_alarm() -> Self {
        Self {
            service_id: protocol::SERVICE_UUID,
            characteristic_id: protocol::ALERT_CHAR_UUID,
            properties: CharacteristicProperties::READ
                | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::WRITE,
            permissions: CharacteristicPermissions::READ,
        }
    }

    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    pub fn characteristic_id(&self) -> Uuid {
        self.characteristic_id
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn permissions(&self) -> CharacteristicPermissions {
        self.permissions
    }
}

/// Last value pushed to the characteristic; empty until the first dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicValue(Option<SignalCode>);

impl CharacteristicValue {
    pub fn signal(&self) -> Option<SignalCode> {
        self.0
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.signal().map(|s| s.token().as_bytes()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        write!(f, "{} (B) {:?}", String::from_utf8_lossy(self.as_bytes()), self.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSnapshot {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: CharacteristicPermissions,
    pub value: CharacteristicValue,
}

pub struct GattServiceModel {
    descriptor: ServiceDescriptor,
    value: CharacteristicValue,
    write_policy: InboundWritePolicy,
}

impl GattServiceModel {
    /// Build the descriptor and register it with the platform's GATT server
    pub async fn register(
        descriptor: ServiceDescriptor,
        write_policy: InboundWritePolicy,
        platform: &mut dyn BlePlatform,
        log: &mut SessionLog,
    ) -> Result<Self, SessionError> {
        log.info("opening GATT server...");
        log.info(format!(
            "adding characteristic {} (properties {})...",
            descriptor.characteristic_id(),
            descriptor.properties()
        ));
        log.info(format!("adding service {}...", descriptor.service_id()));

        if let Err(e) = platform.register_gatt_server(&descriptor, write_policy).await {
            log.error(format!("GATT server registration failed: {}", e));
            return Err(SessionError::Registration(e.to_string()));
        }

        log.success("setup complete.");
        Ok(Self {
            descriptor,
            value: CharacteristicValue::default(),
            write_policy,
        })
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn read_current_value(&self) -> CharacteristicValue {
        self.value
    }

    /// Overwrite the live value. Only the dispatcher calls this.
    pub(super) fn store(&mut self, signal: SignalCode) -> CharacteristicValue {
        self.value = CharacteristicValue(Some(signal));
        self.value
    }

    pub fn snapshot(&self) -> CharacteristicSnapshot {
        CharacteristicSnapshot {
            uuid: self.descriptor.characteristic_id(),
            properties: self.descriptor.properties(),
            permissions: self.descriptor.permissions(),
            value: self.value,
        }
    }

    /// Writes from the central never touch the stored value
    pub fn on_inbound_write(&self, peer: &PeerId, value: &[u8], log: &mut SessionLog) {
        match self.write_policy {
            InboundWritePolicy::Ignore => {
                log.append(
                    MessageSeverity::Debug,
                    format!("ignoring {} byte write from {}", value.len(), peer),
                );
            }
            InboundWritePolicy::Log => {
                log.info(format!(
                    "write from {} acknowledged, not applied: {:?}",
                    peer,
                    String::from_utf8_lossy(value)
                ));
            }
            InboundWritePolicy::Reject => {
                log.warn(format!("write from {} rejected ({} bytes)", peer, value.len()));
            }
        }
    }
}
