//! Transport contract
//!
//! The platform stack behind a session. Requests are fire-and-forget;
//! outcomes come back later as [`TransportEvent`]s on the channel handed to
//! the session.

use crate::domain::command::{GattRequest, ReplyValue};
use crate::domain::models::{CharacteristicId, ConnectionParameters, PeripheralId, PhyPair};
use crate::domain::status::GattStatus;
use crate::error::TransportError;
use tokio::sync::mpsc;

/// Correlates a command reply with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(pub u64);

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Everything the stack can report, solicited or not.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    /// Link is down. `status` is `Success` for an orderly teardown.
    Disconnected { status: GattStatus },
    CommandReply {
        token: CorrelationToken,
        status: GattStatus,
        value: ReplyValue,
    },
    Notification {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    BondStarted,
    BondSucceeded,
    BondFailed,
    BondLost,
    MtuChanged { mtu: u16 },
    /// Signal strength reported without a pending read.
    RssiRead { rssi: i16 },
    PhyUpdated { phy: PhyPair },
    ConnectionParametersUpdated { parameters: ConnectionParameters },
}

/// Platform BLE stack for one peripheral.
///
/// Implementations accept at most one outstanding [`Transport::send`]; the
/// session never issues a second one before the first is answered or timed
/// out.
pub trait Transport: Send + 'static {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Issue one GATT request. The reply arrives as
    /// [`TransportEvent::CommandReply`] carrying the returned token.
    fn send(&mut self, request: &GattRequest) -> Result<CorrelationToken, TransportError>;

    /// Start bonding. The outcome arrives as a bond event.
    fn create_bond(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        (**self).connect(peripheral)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        (**self).disconnect()
    }

    fn send(&mut self, request: &GattRequest) -> Result<CorrelationToken, TransportError> {
        (**self).send(request)
    }

    fn create_bond(&mut self) -> Result<(), TransportError> {
        (**self).create_bond()
    }
}
