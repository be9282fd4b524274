//! In-process simulated peripheral
//!
//! A fake GATT server behind the [`Transport`] contract. Tests and the demo
//! binary drive a session against it without any radio. The
//! [`SimulatedPeripheral`] handle scripts the device (attribute values,
//! bonding requirements, dropped replies, link loss) while the session owns
//! the [`SimulatedTransport`].

use crate::domain::command::{GattRequest, ReplyValue};
use crate::domain::models::{
    Characteristic, CharacteristicId, ConnectionParameters, ConnectionPriority, Descriptor,
    PeripheralId, PhyPair, MAX_MTU,
};
use crate::domain::status::GattStatus;
use crate::error::TransportError;
use crate::infrastructure::transport::{
    event_channel, CorrelationToken, EventReceiver, EventSender, Transport, TransportEvent,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// How the simulated device answers a connect or bond request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    Succeed,
    Fail,
    /// Never answer.
    Ignore,
}

struct SimState {
    events: EventSender,
    characteristics: HashMap<CharacteristicId, Vec<u8>>,
    descriptors: HashMap<Descriptor, Vec<u8>>,
    protected: HashSet<CharacteristicId>,
    connected: bool,
    bonded: bool,
    connect_outcome: SimOutcome,
    bond_outcome: SimOutcome,
    confirm_disconnect: bool,
    drop_replies: usize,
    forced_statuses: VecDeque<GattStatus>,
    latency: Duration,
    max_mtu: u16,
    rssi: i16,
    next_token: u64,
    outstanding: Option<CorrelationToken>,
    overlapping: usize,
    log: Vec<GattRequest>,
    bond_requests: usize,
}

/// Script handle for a simulated device.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    peripheral: PeripheralId,
    state: Arc<Mutex<SimState>>,
}

/// The session-facing half of a simulated device.
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPeripheral {
    /// Create a device together with its transport and the event stream
    /// the session consumes.
    pub fn new(peripheral: PeripheralId) -> (Self, SimulatedTransport, EventReceiver) {
        let (events, receiver) = event_channel();
        let state = Arc::new(Mutex::new(SimState {
            events,
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
            protected: HashSet::new(),
            connected: false,
            bonded: false,
            connect_outcome: SimOutcome::Succeed,
            bond_outcome: SimOutcome::Succeed,
            confirm_disconnect: true,
            drop_replies: 0,
            forced_statuses: VecDeque::new(),
            latency: Duration::ZERO,
            max_mtu: MAX_MTU,
            rssi: -55,
            next_token: 0,
            outstanding: None,
            overlapping: 0,
            log: Vec::new(),
            bond_requests: 0,
        }));
        let handle = Self {
            peripheral,
            state: Arc::clone(&state),
        };
        (handle, SimulatedTransport { state }, receiver)
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    pub fn add_characteristic(&self, characteristic: &Characteristic, value: &[u8]) {
        self.lock()
            .characteristics
            .insert(characteristic.id, value.to_vec());
    }

    pub fn add_descriptor(&self, descriptor: &Descriptor, value: &[u8]) {
        self.lock().descriptors.insert(*descriptor, value.to_vec());
    }

    /// Require a bond before the characteristic can be accessed.
    pub fn protect(&self, characteristic: &Characteristic) {
        self.lock().protected.insert(characteristic.id);
    }

    pub fn value(&self, characteristic: &CharacteristicId) -> Option<Vec<u8>> {
        self.lock().characteristics.get(characteristic).cloned()
    }

    pub fn descriptor_value(&self, descriptor: &Descriptor) -> Option<Vec<u8>> {
        self.lock().descriptors.get(descriptor).cloned()
    }

    pub fn set_connect_outcome(&self, outcome: SimOutcome) {
        self.lock().connect_outcome = outcome;
    }

    pub fn set_bond_outcome(&self, outcome: SimOutcome) {
        self.lock().bond_outcome = outcome;
    }

    /// When false, disconnect requests are never confirmed.
    pub fn set_confirm_disconnect(&self, confirm: bool) {
        self.lock().confirm_disconnect = confirm;
    }

    /// Accept the next `count` requests but never reply to them.
    pub fn drop_next_replies(&self, count: usize) {
        self.lock().drop_replies = count;
    }

    /// Answer the next request with `status` regardless of its content.
    pub fn fail_next(&self, status: GattStatus) {
        self.lock().forced_statuses.push_back(status);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_max_mtu(&self, mtu: u16) {
        self.lock().max_mtu = mtu;
    }

    pub fn set_rssi(&self, rssi: i16) {
        self.lock().rssi = rssi;
    }

    pub fn set_bonded(&self, bonded: bool) {
        self.lock().bonded = bonded;
    }

    pub fn is_bonded(&self) -> bool {
        self.lock().bonded
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Every request the session sent, in order.
    pub fn requests(&self) -> Vec<GattRequest> {
        self.lock().log.clone()
    }

    pub fn bond_requests(&self) -> usize {
        self.lock().bond_requests
    }

    /// Requests sent while another one was still unanswered.
    pub fn overlapping_requests(&self) -> usize {
        self.lock().overlapping
    }

    /// Push a value change to the central.
    pub fn notify(&self, characteristic: &CharacteristicId, value: &[u8]) {
        let mut state = self.lock();
        state
            .characteristics
            .insert(*characteristic, value.to_vec());
        emit(
            &state,
            TransportEvent::Notification {
                characteristic: *characteristic,
                value: value.to_vec(),
            },
        );
    }

    /// Drop the link without the central asking.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.outstanding = None;
        emit(
            &state,
            TransportEvent::Disconnected {
                status: GattStatus::ConnectionLost,
            },
        );
    }

    /// Forget the bond, as if the peripheral was reset.
    pub fn lose_bond(&self) {
        let mut state = self.lock();
        state.bonded = false;
        emit(&state, TransportEvent::BondLost);
    }

    /// Start pairing from the peripheral side.
    pub fn start_remote_bonding(&self) {
        let state = self.lock();
        emit(&state, TransportEvent::BondStarted);
    }

    pub fn finish_remote_bonding(&self, success: bool) {
        let mut state = self.lock();
        state.bonded = success;
        let event = if success {
            TransportEvent::BondSucceeded
        } else {
            TransportEvent::BondFailed
        };
        emit(&state, event);
    }

    /// Announce an MTU the peripheral negotiated on its own.
    pub fn change_mtu(&self, mtu: u16) {
        let state = self.lock();
        emit(&state, TransportEvent::MtuChanged { mtu });
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not hide the device from the others.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn emit(state: &SimState, event: TransportEvent) {
    trace!("Simulated event: {:?}", event);
    if state.latency.is_zero() {
        let _ = state.events.send(event);
    } else {
        let events = state.events.clone();
        let latency = state.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = events.send(event);
        });
    }
}

impl SimState {
    fn guard(&self, characteristic: &CharacteristicId) -> Option<GattStatus> {
        if self.protected.contains(characteristic) && !self.bonded {
            Some(GattStatus::InsufficientAuthentication)
        } else {
            None
        }
    }

    fn execute(&mut self, request: &GattRequest) -> (GattStatus, ReplyValue) {
        if let Some(status) = self.forced_statuses.pop_front() {
            return (status, ReplyValue::None);
        }
        match request {
            GattRequest::ReadCharacteristic(c) => {
                if let Some(status) = self.guard(&c.id) {
                    return (status, ReplyValue::None);
                }
                match self.characteristics.get(&c.id) {
                    Some(value) => (GattStatus::Success, ReplyValue::Bytes(value.clone())),
                    None => (GattStatus::InvalidRequest, ReplyValue::None),
                }
            }
            GattRequest::WriteCharacteristic {
                characteristic,
                value,
                ..
            } => {
                if let Some(status) = self.guard(&characteristic.id) {
                    return (status, ReplyValue::None);
                }
                self.characteristics.insert(characteristic.id, value.clone());
                (GattStatus::Success, ReplyValue::None)
            }
            GattRequest::ReadDescriptor(d) => match self.descriptors.get(d) {
                Some(value) => (GattStatus::Success, ReplyValue::Bytes(value.clone())),
                None => (GattStatus::InvalidRequest, ReplyValue::None),
            },
            GattRequest::WriteDescriptor { descriptor, value } => {
                if let Some(status) = self.guard(&descriptor.characteristic) {
                    return (status, ReplyValue::None);
                }
                self.descriptors.insert(*descriptor, value.clone());
                (GattStatus::Success, ReplyValue::None)
            }
            GattRequest::SetNotify { characteristic, .. } => match self.guard(&characteristic.id) {
                Some(status) => (status, ReplyValue::None),
                None => (GattStatus::Success, ReplyValue::None),
            },
            GattRequest::RequestMtu(mtu) => (
                GattStatus::Success,
                ReplyValue::Mtu((*mtu).min(self.max_mtu)),
            ),
            GattRequest::ReadRssi => (GattStatus::Success, ReplyValue::Rssi(self.rssi)),
            GattRequest::RequestConnectionPriority(_) => (GattStatus::Success, ReplyValue::None),
            GattRequest::SetPreferredPhy { tx, rx, .. } => (
                GattStatus::Success,
                ReplyValue::Phy(PhyPair { tx: *tx, rx: *rx }),
            ),
            GattRequest::CreateBond => (GattStatus::RequestNotSupported, ReplyValue::None),
        }
    }
}

fn parameters_for(priority: ConnectionPriority) -> ConnectionParameters {
    match priority {
        ConnectionPriority::High => ConnectionParameters {
            interval: 6,
            latency: 0,
            supervision_timeout: 500,
        },
        ConnectionPriority::Balanced => ConnectionParameters {
            interval: 36,
            latency: 0,
            supervision_timeout: 500,
        },
        ConnectionPriority::LowPower => ConnectionParameters {
            interval: 80,
            latency: 2,
            supervision_timeout: 500,
        },
    }
}

impl Transport for SimulatedTransport {
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        debug!("Simulated connect to {}", peripheral);
        match state.connect_outcome {
            SimOutcome::Succeed => {
                state.connected = true;
                emit(&state, TransportEvent::Connected);
            }
            SimOutcome::Fail => emit(
                &state,
                TransportEvent::Disconnected {
                    status: GattStatus::Failure,
                },
            ),
            SimOutcome::Ignore => {}
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.connected = false;
        state.outstanding = None;
        if state.confirm_disconnect {
            emit(
                &state,
                TransportEvent::Disconnected {
                    status: GattStatus::Success,
                },
            );
        }
        Ok(())
    }

    fn send(&mut self, request: &GattRequest) -> Result<CorrelationToken, TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.outstanding.is_some() {
            state.overlapping += 1;
        }
        state.next_token += 1;
        let token = CorrelationToken(state.next_token);
        state.log.push(request.clone());

        if state.drop_replies > 0 {
            state.drop_replies -= 1;
            debug!("Simulated device dropping {}", request);
            return Ok(token);
        }

        state.outstanding = Some(token);
        let (status, value) = state.execute(request);
        let reply = TransportEvent::CommandReply {
            token,
            status,
            value,
        };
        // The reply is computed now; only delivery is delayed. The request
        // stays outstanding until the reply is on its way to the session.
        if state.latency.is_zero() {
            let _ = state.events.send(reply);
            state.outstanding = None;
        } else {
            let shared = Arc::clone(&self.state);
            let latency = state.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let mut state = lock(&shared);
                let _ = state.events.send(reply);
                if state.outstanding == Some(token) {
                    state.outstanding = None;
                }
            });
        }
        if let (GattRequest::RequestConnectionPriority(priority), GattStatus::Success) =
            (request, status)
        {
            emit(
                &state,
                TransportEvent::ConnectionParametersUpdated {
                    parameters: parameters_for(*priority),
                },
            );
        }
        Ok(token)
    }

    fn create_bond(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.bond_requests += 1;
        emit(&state, TransportEvent::BondStarted);
        match state.bond_outcome {
            SimOutcome::Succeed => {
                state.bonded = true;
                emit(&state, TransportEvent::BondSucceeded);
            }
            SimOutcome::Fail => emit(&state, TransportEvent::BondFailed),
            SimOutcome::Ignore => {}
        }
        Ok(())
    }
}
