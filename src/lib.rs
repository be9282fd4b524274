//! Awaitable GATT central sessions.
//!
//! A [`PeripheralSession`] wraps one peripheral behind a platform
//! [`Transport`]: commands are queued and run one at a time, connection
//! loss and timeouts resolve every outstanding call, and commands rejected
//! for missing authentication are retried once after bonding.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod session;

pub use domain::command::{CommandResult, GattRequest, ReplyValue};
pub use domain::models::{
    BondState, Characteristic, CharacteristicId, CharacteristicProperties, ConnectionState,
    Descriptor, PeripheralId, SessionSnapshot, WriteType,
};
pub use domain::settings::{Settings, SettingsService};
pub use domain::status::GattStatus;
pub use error::{SessionError, TransportError, ValidationError};
pub use infrastructure::transport::{Transport, TransportEvent};
pub use session::{PeripheralSession, SessionObserver};
