//! GATT commands
//!
//! A [`GattCommand`] is one unit of work for the radio: what to do, on which
//! attribute, and where to deliver the single terminal result.

use crate::domain::models::{
    Characteristic, ConnectionParameters, ConnectionPriority, Descriptor, NotifyMode, Phy,
    PhyOptions, PhyPair, WriteType,
};
use crate::domain::status::GattStatus;
use std::fmt;
use tokio::sync::oneshot;

/// What a command asks the transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    ReadCharacteristic(Characteristic),
    WriteCharacteristic {
        characteristic: Characteristic,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor(Descriptor),
    WriteDescriptor {
        descriptor: Descriptor,
        value: Vec<u8>,
    },
    SetNotify {
        characteristic: Characteristic,
        mode: NotifyMode,
    },
    RequestMtu(u16),
    ReadRssi,
    RequestConnectionPriority(ConnectionPriority),
    SetPreferredPhy {
        tx: Phy,
        rx: Phy,
        options: PhyOptions,
    },
    CreateBond,
}

/// Command kinds, used to pick per-kind timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ReadCharacteristic,
    WriteCharacteristic,
    ReadDescriptor,
    WriteDescriptor,
    SetNotify,
    RequestMtu,
    ReadRssi,
    RequestConnectionPriority,
    SetPreferredPhy,
    CreateBond,
}

impl GattRequest {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::ReadCharacteristic(_) => CommandKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => CommandKind::WriteCharacteristic,
            Self::ReadDescriptor(_) => CommandKind::ReadDescriptor,
            Self::WriteDescriptor { .. } => CommandKind::WriteDescriptor,
            Self::SetNotify { .. } => CommandKind::SetNotify,
            Self::RequestMtu(_) => CommandKind::RequestMtu,
            Self::ReadRssi => CommandKind::ReadRssi,
            Self::RequestConnectionPriority(_) => CommandKind::RequestConnectionPriority,
            Self::SetPreferredPhy { .. } => CommandKind::SetPreferredPhy,
            Self::CreateBond => CommandKind::CreateBond,
        }
    }
}

impl fmt::Display for GattRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadCharacteristic(c) => write!(f, "read {}", c.id),
            Self::WriteCharacteristic {
                characteristic,
                value,
                write_type,
            } => write!(
                f,
                "write {} ({} bytes, {:?})",
                characteristic.id,
                value.len(),
                write_type
            ),
            Self::ReadDescriptor(d) => write!(f, "read descriptor {}", d),
            Self::WriteDescriptor { descriptor, value } => {
                write!(f, "write descriptor {} ({} bytes)", descriptor, value.len())
            }
            Self::SetNotify {
                characteristic,
                mode,
            } => write!(f, "set notify {} {:?}", characteristic.id, mode),
            Self::RequestMtu(mtu) => write!(f, "request mtu {}", mtu),
            Self::ReadRssi => f.write_str("read rssi"),
            Self::RequestConnectionPriority(p) => write!(f, "request priority {:?}", p),
            Self::SetPreferredPhy { tx, rx, options } => {
                write!(f, "set phy tx={:?} rx={:?} ({:?})", tx, rx, options)
            }
            Self::CreateBond => f.write_str("create bond"),
        }
    }
}

/// Payload carried by a successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    None,
    Bytes(Vec<u8>),
    Mtu(u16),
    Rssi(i16),
    Phy(PhyPair),
    ConnectionParameters(ConnectionParameters),
}

pub type CommandResult = Result<ReplyValue, GattStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued unit of work with its completion sink.
///
/// Resolution consumes the command, so a command can never be resolved
/// twice.
#[derive(Debug)]
pub struct GattCommand {
    id: CommandId,
    request: GattRequest,
    completion: Option<oneshot::Sender<CommandResult>>,
    bonding_attempted: bool,
}

impl GattCommand {
    pub fn new(
        id: CommandId,
        request: GattRequest,
        completion: Option<oneshot::Sender<CommandResult>>,
    ) -> Self {
        Self {
            id,
            request,
            completion,
            bonding_attempted: false,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn request(&self) -> &GattRequest {
        &self.request
    }

    pub fn kind(&self) -> CommandKind {
        self.request.kind()
    }

    /// Whether this command already went through a bonding retry.
    pub fn bonding_attempted(&self) -> bool {
        self.bonding_attempted
    }

    pub fn mark_bonding_attempted(&mut self) {
        self.bonding_attempted = true;
    }

    /// Deliver the terminal result. A caller that stopped waiting is not an
    /// error; the result is simply dropped.
    pub fn resolve(self, result: CommandResult) {
        if let Some(tx) = self.completion {
            let _ = tx.send(result);
        }
    }
}
