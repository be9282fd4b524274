//! Peripheral Session Module
//!
//! Turns a callback-driven BLE transport into awaitable operations on one
//! peripheral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PeripheralSession                     │
//! │     (cloneable handle - validation + async operations)   │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │ SessionRequest (mpsc)
//!                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 SessionCore (actor task)                 │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │   Queue    │  │  Connection  │  │     Bonding      │  │
//! │  │ - FIFO     │  │ - lifecycle  │  │ - bond state     │  │
//! │  │ - 1 slot   │  │ - reconnect  │  │ - auth retry     │  │
//! │  └────────────┘  └──────────────┘  └──────────────────┘  │
//! └───────┬───────────────────▲───────────────────┬──────────┘
//!         │ Transport calls   │ TransportEvent    │ SessionObserver
//!         ▼                   │                   ▼
//!     platform stack ─────────┘               application
//! ```
//!
//! ## Modules
//!
//! - [`queue`] - ordered command queue and the in-flight slot
//! - [`connection`] - connection lifecycle and reconnect policy
//! - [`bonding`] - bond sub-state and dispatch blocking
//! - [`engine`] - the serialization point composing the three
//! - [`observer`] - callbacks fanned out to the application

pub mod bonding;
pub mod connection;
pub mod engine;
pub mod observer;
pub mod queue;

use crate::domain::command::{GattRequest, ReplyValue};
use crate::domain::models::{
    BondState, Characteristic, CharacteristicId, CharacteristicProperties, ConnectionPriority,
    ConnectionState, Descriptor, NotifyMode, PeripheralId, Phy, PhyOptions, PhyPair,
    SessionSnapshot, WriteType, ATT_HEADER_SIZE, DEFAULT_MTU, MAX_MTU,
};
use crate::domain::settings::Settings;
use crate::domain::status::GattStatus;
use crate::error::{SessionError, ValidationError};
use crate::infrastructure::transport::{EventReceiver, Transport};
use self::engine::{SessionCore, SessionRequest};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub use observer::SessionObserver;

/// Handle to a session with one peripheral.
///
/// Clones share the same session. The session ends when the last clone is
/// dropped; outstanding commands then resolve with `ConnectionLost`.
#[derive(Clone)]
pub struct PeripheralSession {
    peripheral: PeripheralId,
    requests: mpsc::UnboundedSender<SessionRequest>,
    state: watch::Receiver<SessionSnapshot>,
}

impl PeripheralSession {
    /// Start a session task on the current tokio runtime.
    ///
    /// `events` must be the stream the transport reports into.
    pub fn spawn<T: Transport>(
        peripheral: PeripheralId,
        settings: Settings,
        transport: T,
        events: EventReceiver,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionSnapshot::default());
        let core = SessionCore::new(peripheral.clone(), settings, transport, observer, state_tx);
        tokio::spawn(run(core, request_rx, events));
        Self {
            peripheral,
            requests,
            state,
        }
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection_state
    }

    pub fn bond_state(&self) -> BondState {
        self.state.borrow().bond_state
    }

    pub fn mtu(&self) -> u16 {
        self.state.borrow().mtu
    }

    pub fn is_notifying(&self, characteristic: &CharacteristicId) -> bool {
        self.state.borrow().notifying.contains(characteristic)
    }

    /// Receiver that wakes on every published state change.
    pub fn state_changes(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_connection_state(
        &self,
        state: ConnectionState,
    ) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        if rx.wait_for(|s| s.connection_state == state).await.is_err() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Ask for a connection. The outcome is reported through the state
    /// and the observer.
    /// Start connecting. While a disconnect is still tearing down, the
    /// attempt starts once teardown completes.
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(SessionRequest::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionRequest::Disconnect)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) -> Result<(), SessionError> {
        self.send(SessionRequest::SetAutoReconnect(enabled))
    }

    pub async fn read_characteristic(
        &self,
        characteristic: &Characteristic,
    ) -> Result<Vec<u8>, SessionError> {
        if !characteristic
            .properties
            .contains(CharacteristicProperties::READ)
        {
            return Err(ValidationError::NotReadable.into());
        }
        let value = self
            .submit(GattRequest::ReadCharacteristic(*characteristic))
            .await?;
        bytes(value)
    }

    pub async fn write_characteristic(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), SessionError> {
        if !characteristic
            .properties
            .contains(write_type.required_property())
        {
            return Err(ValidationError::NotWritable.into());
        }
        self.check_payload(value, write_type.overhead())?;
        self.submit(GattRequest::WriteCharacteristic {
            characteristic: *characteristic,
            value: value.to_vec(),
            write_type,
        })
        .await?;
        Ok(())
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>, SessionError> {
        let value = self
            .submit(GattRequest::ReadDescriptor(*descriptor))
            .await?;
        bytes(value)
    }

    pub async fn write_descriptor(
        &self,
        descriptor: &Descriptor,
        value: &[u8],
    ) -> Result<(), SessionError> {
        self.check_payload(value, ATT_HEADER_SIZE)?;
        self.submit(GattRequest::WriteDescriptor {
            descriptor: *descriptor,
            value: value.to_vec(),
        })
        .await?;
        Ok(())
    }

    /// Enable or disable notifications. Notify is preferred over indicate
    /// when the characteristic supports both.
    pub async fn set_notify(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Result<(), SessionError> {
        let props = characteristic.properties;
        let mode = if !characteristic.supports_notify() {
            return Err(ValidationError::NotNotifiable.into());
        } else if !enable {
            NotifyMode::Disabled
        } else if props.contains(CharacteristicProperties::NOTIFY) {
            NotifyMode::Notify
        } else {
            NotifyMode::Indicate
        };
        self.submit(GattRequest::SetNotify {
            characteristic: *characteristic,
            mode,
        })
        .await?;
        Ok(())
    }

    /// Returns the MTU actually negotiated.
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16, SessionError> {
        if !(DEFAULT_MTU..=MAX_MTU).contains(&mtu) {
            return Err(ValidationError::MtuOutOfRange(mtu).into());
        }
        match self.submit(GattRequest::RequestMtu(mtu)).await? {
            ReplyValue::Mtu(negotiated) => Ok(negotiated),
            other => unexpected(other),
        }
    }

    pub async fn read_rssi(&self) -> Result<i16, SessionError> {
        match self.submit(GattRequest::ReadRssi).await? {
            ReplyValue::Rssi(rssi) => Ok(rssi),
            other => unexpected(other),
        }
    }

    pub async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<(), SessionError> {
        self.submit(GattRequest::RequestConnectionPriority(priority))
            .await?;
        Ok(())
    }

    /// Returns the PHYs in use after the update.
    pub async fn set_preferred_phy(
        &self,
        tx: Phy,
        rx: Phy,
        options: PhyOptions,
    ) -> Result<PhyPair, SessionError> {
        match self
            .submit(GattRequest::SetPreferredPhy { tx, rx, options })
            .await?
        {
            ReplyValue::Phy(phy) => Ok(phy),
            ReplyValue::None => Ok(PhyPair { tx, rx }),
            other => unexpected(other),
        }
    }

    /// Bond with the peripheral. Succeeds immediately when already bonded.
    pub async fn create_bond(&self) -> Result<(), SessionError> {
        self.submit(GattRequest::CreateBond).await?;
        Ok(())
    }

    /// `overhead` is the part of the ATT PDU the value cannot use.
    fn check_payload(&self, value: &[u8], overhead: u16) -> Result<(), ValidationError> {
        if value.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        let max = usize::from(self.mtu().saturating_sub(overhead));
        if value.len() > max {
            return Err(ValidationError::PayloadTooLarge {
                size: value.len(),
                max,
            });
        }
        Ok(())
    }

    async fn submit(&self, request: GattRequest) -> Result<ReplyValue, SessionError> {
        let (completion, result) = oneshot::channel();
        self.send(SessionRequest::Submit {
            request,
            completion,
        })?;
        match result.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(SessionError::Gatt(status)),
            Err(_) => Err(SessionError::Closed),
        }
    }

    fn send(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.requests
            .send(request)
            .map_err(|_| SessionError::Closed)
    }
}

fn bytes(value: ReplyValue) -> Result<Vec<u8>, SessionError> {
    match value {
        ReplyValue::Bytes(bytes) => Ok(bytes),
        ReplyValue::None => Ok(Vec::new()),
        other => unexpected(other),
    }
}

fn unexpected<T>(value: ReplyValue) -> Result<T, SessionError> {
    warn!("Unexpected reply payload: {:?}", value);
    Err(SessionError::Gatt(GattStatus::Failure))
}

/// Session task: the only place the core is touched.
async fn run<T: Transport>(
    mut core: SessionCore<T>,
    mut requests: mpsc::UnboundedReceiver<SessionRequest>,
    mut events: EventReceiver,
) {
    let mut events_open = true;
    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => core.handle_request(request, Instant::now()),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => core.handle_event(event, Instant::now()),
                None => {
                    warn!("Transport event stream for {} closed", core.peripheral());
                    events_open = false;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                core.on_tick(Instant::now());
            }
        }
    }
    debug!("Session with {} ended", core.peripheral());
    core.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated::SimulatedPeripheral;
    use std::time::Duration;
    use uuid::Uuid;

    fn heart_rate() -> Characteristic {
        Characteristic::new(
            Uuid::from_u128(0x180D),
            Uuid::from_u128(0x2A37),
            0x000E,
            CharacteristicProperties::NOTIFY,
        )
    }

    fn control_point() -> Characteristic {
        Characteristic::new(
            Uuid::from_u128(0x180D),
            Uuid::from_u128(0x2A39),
            0x0012,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
        )
    }

    fn session() -> (PeripheralSession, SimulatedPeripheral) {
        session_with(Settings::default())
    }

    fn session_with(settings: Settings) -> (PeripheralSession, SimulatedPeripheral) {
        let peripheral = PeripheralId::new("12:34:56:78:9A:BC", "strap");
        let (device, transport, events) = SimulatedPeripheral::new(peripheral.clone());
        device.add_characteristic(&heart_rate(), &[0, 72]);
        device.add_characteristic(&control_point(), &[0]);
        let session = PeripheralSession::spawn(peripheral, settings, transport, events, None);
        (session, device)
    }

    async fn connected() -> (PeripheralSession, SimulatedPeripheral) {
        let (session, device) = session();
        session.connect().unwrap();
        session
            .wait_for_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        (session, device)
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (session, device) = connected().await;
        session
            .write_characteristic(&control_point(), &[1, 2], WriteType::WithResponse)
            .await
            .unwrap();
        assert_eq!(
            session.read_characteristic(&control_point()).await.unwrap(),
            vec![1, 2]
        );
        assert_eq!(device.value(&control_point().id), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_queueing() {
        let (session, device) = connected().await;

        assert_eq!(
            session.read_characteristic(&heart_rate()).await,
            Err(SessionError::Validation(ValidationError::NotReadable))
        );
        assert_eq!(
            session
                .write_characteristic(&control_point(), &[1], WriteType::WithoutResponse)
                .await,
            Err(SessionError::Validation(ValidationError::NotWritable))
        );
        assert_eq!(
            session
                .write_characteristic(&control_point(), &[], WriteType::WithResponse)
                .await,
            Err(SessionError::Validation(ValidationError::EmptyPayload))
        );
        assert_eq!(
            session
                .write_characteristic(&control_point(), &[0; 21], WriteType::WithResponse)
                .await,
            Err(SessionError::Validation(ValidationError::PayloadTooLarge {
                size: 21,
                max: 20
            }))
        );
        assert_eq!(
            session.set_notify(&control_point(), true).await,
            Err(SessionError::Validation(ValidationError::NotNotifiable))
        );
        assert_eq!(
            session.request_mtu(600).await,
            Err(SessionError::Validation(ValidationError::MtuOutOfRange(600)))
        );
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn test_mtu_widens_payload_limit() {
        let (session, device) = connected().await;
        device.set_max_mtu(185);
        assert_eq!(session.request_mtu(247).await.unwrap(), 185);
        assert_eq!(session.mtu(), 185);
        session
            .write_characteristic(&control_point(), &[0; 182], WriteType::WithResponse)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_signed_write_leaves_room_for_signature() {
        let (session, device) = connected().await;
        let signed = Characteristic::new(
            Uuid::from_u128(0x180D),
            Uuid::from_u128(0xFFA0),
            0x0016,
            CharacteristicProperties::SIGNED_WRITE,
        );
        device.add_characteristic(&signed, &[0]);

        assert_eq!(
            session
                .write_characteristic(&signed, &[0; 9], WriteType::Signed)
                .await,
            Err(SessionError::Validation(ValidationError::PayloadTooLarge {
                size: 9,
                max: 8
            }))
        );
        assert!(device.requests().is_empty());
        session
            .write_characteristic(&signed, &[0; 8], WriteType::Signed)
            .await
            .unwrap();
        assert_eq!(device.value(&signed.id), Some(vec![0; 8]));
    }

    #[tokio::test]
    async fn test_descriptor_read_and_write() {
        let (session, device) = connected().await;
        let user_description = Descriptor {
            characteristic: control_point().id,
            uuid: Uuid::from_u128(0x2901),
            handle: 0x0014,
        };
        device.add_descriptor(&user_description, b"reset");

        assert_eq!(
            session.read_descriptor(&user_description).await.unwrap(),
            b"reset".to_vec()
        );
        session
            .write_descriptor(&user_description, b"clear")
            .await
            .unwrap();
        assert_eq!(
            device.descriptor_value(&user_description),
            Some(b"clear".to_vec())
        );
        assert_eq!(
            session.read_descriptor(&user_description).await.unwrap(),
            b"clear".to_vec()
        );

        assert_eq!(
            session.write_descriptor(&user_description, &[0; 21]).await,
            Err(SessionError::Validation(ValidationError::PayloadTooLarge {
                size: 21,
                max: 20
            }))
        );
        let missing = Descriptor {
            handle: 0x0015,
            ..user_description
        };
        assert_eq!(
            session.read_descriptor(&missing).await,
            Err(SessionError::Gatt(GattStatus::InvalidRequest))
        );
    }

    #[tokio::test]
    async fn test_notify_subscription_tracked() {
        let (session, device) = connected().await;
        session.set_notify(&heart_rate(), true).await.unwrap();
        assert!(session.is_notifying(&heart_rate().id));
        assert!(matches!(
            device.requests().last(),
            Some(GattRequest::SetNotify {
                mode: NotifyMode::Notify,
                ..
            })
        ));

        session.set_notify(&heart_rate(), false).await.unwrap();
        assert!(!session.is_notifying(&heart_rate().id));
    }

    #[tokio::test]
    async fn test_link_operations() {
        let (session, device) = connected().await;
        device.set_rssi(-70);
        assert_eq!(session.read_rssi().await.unwrap(), -70);
        session
            .request_connection_priority(ConnectionPriority::High)
            .await
            .unwrap();
        let phy = session
            .set_preferred_phy(Phy::Le2M, Phy::Le2M, PhyOptions::NoPreferred)
            .await
            .unwrap();
        assert_eq!(
            phy,
            PhyPair {
                tx: Phy::Le2M,
                rx: Phy::Le2M
            }
        );
    }

    #[tokio::test]
    async fn test_protected_read_bonds_transparently() {
        let (session, device) = connected().await;
        device.protect(&control_point());
        assert_eq!(
            session.read_characteristic(&control_point()).await.unwrap(),
            vec![0]
        );
        assert_eq!(session.bond_state(), BondState::Bonded);
        assert_eq!(device.bond_requests(), 1);

        session.create_bond().await.unwrap();
        assert_eq!(device.bond_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_command_times_out() {
        let (session, device) = connected().await;
        device.drop_next_replies(1);
        let started = Instant::now();
        assert_eq!(
            session.read_characteristic(&control_point()).await,
            Err(SessionError::Gatt(GattStatus::Timeout))
        );
        assert!(started.elapsed() >= Duration::from_secs(30));

        // The radio is free again.
        assert_eq!(
            session.read_characteristic(&control_point()).await.unwrap(),
            vec![0]
        );
    }

    #[tokio::test]
    async fn test_link_loss_fails_in_flight_command() {
        let (session, device) = connected().await;
        device.drop_next_replies(1);
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.read_characteristic(&control_point()).await })
        };
        let mut changes = session.state_changes();
        changes
            .wait_for(|s| s.queued_commands == 1)
            .await
            .unwrap();

        device.drop_link();
        assert_eq!(
            pending.await.unwrap(),
            Err(SessionError::Gatt(GattStatus::ConnectionLost))
        );
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_after_link_loss() {
        let mut settings = Settings::default();
        settings.auto_reconnect.enabled = true;
        let (session, device) = session_with(settings);
        session.connect().unwrap();
        session
            .wait_for_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        let mut changes = session.state_changes();

        device.drop_link();
        changes
            .wait_for(|s| s.connection_state == ConnectionState::Disconnected)
            .await
            .unwrap();
        session
            .wait_for_connection_state(ConnectionState::Connected)
            .await
            .unwrap();
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_connect_right_after_disconnect() {
        let (session, device) = connected().await;
        session.disconnect().unwrap();
        session.connect().unwrap();
        assert_eq!(
            session.read_characteristic(&control_point()).await.unwrap(),
            vec![0]
        );
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(device.is_connected());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_session() {
        let (session, device) = connected().await;
        drop(session);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!device.is_connected());
    }
}
