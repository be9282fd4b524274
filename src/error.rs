use crate::domain::status::GattStatus;
use thiserror::Error;

/// Caller mistakes caught before a command is queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Characteristic is not readable")]
    NotReadable,

    #[error("Characteristic does not support this write type")]
    NotWritable,

    #[error("Characteristic supports neither notify nor indicate")]
    NotNotifiable,

    #[error("Value must not be empty")]
    EmptyPayload,

    #[error("Value exceeds MTU payload ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("MTU {0} outside 23..=517")]
    MtuOutOfRange(u16),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("GATT operation failed: {0}")]
    Gatt(GattStatus),

    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Status for GATT failures, `None` for everything rejected locally.
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            Self::Gatt(status) => Some(*status),
            _ => None,
        }
    }
}

impl From<GattStatus> for SessionError {
    fn from(status: GattStatus) -> Self {
        Self::Gatt(status)
    }
}

/// A transport refusing a request outright.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("A request is already outstanding")]
    Busy,

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    pub fn status(&self) -> GattStatus {
        match self {
            Self::NotConnected => GattStatus::ConnectionLost,
            Self::Busy | Self::Unavailable(_) => GattStatus::ResourceUnavailable,
        }
    }
}
