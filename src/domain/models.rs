use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Default ATT MTU before any exchange has happened.
pub const DEFAULT_MTU: u16 = 23;
/// Largest MTU a central may ask for.
pub const MAX_MTU: u16 = 517;
/// Bytes of every ATT PDU taken by the opcode and handle.
pub const ATT_HEADER_SIZE: u16 = 3;
/// Authentication signature appended to a signed write.
pub const SIGNATURE_SIZE: u16 = 12;

/// Stable identity of the remote device a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId {
    pub address: String,
    pub name: String,
}

impl PeripheralId {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

bitflags! {
    /// Capability bits a characteristic advertises, as carried in its
    /// declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const SIGNED_WRITE = 0x40;
    }
}

/// Address of a characteristic inside the remote GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
    /// Attribute handle, disambiguates repeated UUIDs within a service.
    pub handle: u16,
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#06x}", self.uuid, self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Characteristic {
    pub id: CharacteristicId,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    pub fn new(
        service: Uuid,
        uuid: Uuid,
        handle: u16,
        properties: CharacteristicProperties,
    ) -> Self {
        Self {
            id: CharacteristicId {
                service,
                uuid,
                handle,
            },
            properties,
        }
    }

    pub fn supports_notify(&self) -> bool {
        self.properties.contains(CharacteristicProperties::NOTIFY)
            || self.properties.contains(CharacteristicProperties::INDICATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub characteristic: CharacteristicId,
    pub uuid: Uuid,
    pub handle: u16,
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{:#06x}", self.characteristic, self.uuid, self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

impl WriteType {
    /// Property the target characteristic must advertise for this write type.
    pub fn required_property(self) -> CharacteristicProperties {
        match self {
            Self::WithResponse => CharacteristicProperties::WRITE,
            Self::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            Self::Signed => CharacteristicProperties::SIGNED_WRITE,
        }
    }

    /// PDU bytes not available to the value.
    pub fn overhead(self) -> u16 {
        match self {
            Self::Signed => ATT_HEADER_SIZE + SIGNATURE_SIZE,
            _ => ATT_HEADER_SIZE,
        }
    }
}

/// Value written to the client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyMode {
    Disabled,
    Notify,
    Indicate,
}

impl NotifyMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn cccd_value(self) -> [u8; 2] {
        match self {
            Self::Disabled => [0x00, 0x00],
            Self::Notify => [0x01, 0x00],
            Self::Indicate => [0x02, 0x00],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Coding preference when `Phy::LeCoded` is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhyOptions {
    NoPreferred,
    S2,
    S8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhyPair {
    pub tx: Phy,
    pub rx: Phy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Connection interval in units of 1.25 ms.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in units of 10 ms.
    pub supervision_timeout: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    NotBonded,
    Bonding,
    Bonded,
}

/// Point-in-time view of a session, published before observers run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub bond_state: BondState,
    pub mtu: u16,
    pub notifying: HashSet<CharacteristicId>,
    /// Commands waiting in the queue, the in-flight one included.
    pub queued_commands: usize,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            bond_state: BondState::NotBonded,
            mtu: DEFAULT_MTU,
            notifying: HashSet::new(),
            queued_commands: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_contains() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.contains(CharacteristicProperties::READ));
        assert!(props.contains(CharacteristicProperties::NOTIFY));
        assert!(!props.contains(CharacteristicProperties::WRITE));
        assert_eq!(props.bits(), 0x12);
        assert_eq!(
            CharacteristicProperties::from_bits_truncate(0x8A),
            CharacteristicProperties::READ | CharacteristicProperties::WRITE
        );
    }

    #[test]
    fn test_signed_write_overhead() {
        assert_eq!(WriteType::WithResponse.overhead(), 3);
        assert_eq!(WriteType::WithoutResponse.overhead(), 3);
        assert_eq!(WriteType::Signed.overhead(), 15);
    }

    #[test]
    fn test_supports_notify_with_indicate_only() {
        let c = Characteristic::new(
            Uuid::nil(),
            Uuid::nil(),
            0x10,
            CharacteristicProperties::INDICATE,
        );
        assert!(c.supports_notify());
    }

    #[test]
    fn test_cccd_values() {
        assert_eq!(NotifyMode::Notify.cccd_value(), [0x01, 0x00]);
        assert_eq!(NotifyMode::Indicate.cccd_value(), [0x02, 0x00]);
        assert!(!NotifyMode::Disabled.is_enabled());
    }
}
