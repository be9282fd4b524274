//! GATT status codes
//!
//! Closed set of outcomes every command resolves to, plus the mapping from
//! native ATT / stack result codes.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattStatus {
    Success,
    /// Unclassified failure reported by the stack.
    Failure,
    InsufficientAuthentication,
    InsufficientEncryption,
    ReadNotPermitted,
    WriteNotPermitted,
    RequestNotSupported,
    InvalidAttributeLength,
    InvalidRequest,
    ResourceUnavailable,
    /// No reply arrived before the command's deadline.
    Timeout,
    /// The link went down while the command was queued or in flight.
    ConnectionLost,
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Failures that can be cured by bonding with the peripheral.
    pub fn requires_bonding(self) -> bool {
        matches!(
            self,
            Self::InsufficientAuthentication | Self::InsufficientEncryption
        )
    }

    /// Map an ATT error code (Bluetooth Core Vol 3 Part F 3.4.1.1) or one of
    /// the common stack-level codes layered on top of it.
    pub fn from_native(code: u16) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 | 0x07 | 0x0A | 0x0B => Self::InvalidRequest,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x05 | 0x08 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x0C | 0x0F => Self::InsufficientEncryption,
            0x0D => Self::InvalidAttributeLength,
            0x11 => Self::ResourceUnavailable,
            // Stack congestion / out of resources.
            0x80 | 0x8F => Self::ResourceUnavailable,
            0x89 => Self::InsufficientAuthentication,
            0x93 => Self::Timeout,
            _ => Self::Failure,
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::InsufficientAuthentication => "insufficient authentication",
            Self::InsufficientEncryption => "insufficient encryption",
            Self::ReadNotPermitted => "read not permitted",
            Self::WriteNotPermitted => "write not permitted",
            Self::RequestNotSupported => "request not supported",
            Self::InvalidAttributeLength => "invalid attribute length",
            Self::InvalidRequest => "invalid request",
            Self::ResourceUnavailable => "resource unavailable",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection lost",
        };
        f.write_str(text)
    }
}
