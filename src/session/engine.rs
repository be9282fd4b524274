//! Session core
//!
//! The single serialization point of a session. Owns the queue, the
//! connection state machine, the bonding coordinator and the transport.
//! Every method runs to completion without awaiting; the actor in
//! [`super`] feeds it requests, transport events and deadline ticks.

use crate::domain::command::{CommandId, CommandResult, GattCommand, GattRequest, ReplyValue};
use crate::domain::models::{
    BondState, CharacteristicId, ConnectionState, PeripheralId, SessionSnapshot, DEFAULT_MTU,
};
use crate::domain::settings::Settings;
use crate::domain::status::GattStatus;
use crate::infrastructure::transport::{CorrelationToken, Transport, TransportEvent};
use crate::session::bonding::{BondTrigger, BondingCoordinator};
use crate::session::connection::{
    ConnectRequest, ConnectionStateMachine, DisconnectCause, DisconnectRequest,
};
use crate::session::observer::SessionObserver;
use crate::session::queue::GattCommandQueue;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Work submitted through a [`super::PeripheralSession`] handle.
#[derive(Debug)]
pub enum SessionRequest {
    Connect,
    Disconnect,
    SetAutoReconnect(bool),
    Submit {
        request: GattRequest,
        completion: oneshot::Sender<CommandResult>,
    },
}

pub struct SessionCore<T: Transport> {
    peripheral: PeripheralId,
    settings: Settings,
    transport: T,
    observer: Option<Arc<dyn SessionObserver>>,
    connection: ConnectionStateMachine,
    bonding: BondingCoordinator,
    queue: GattCommandQueue,
    /// Last command enqueued before a deferred connect. Later commands
    /// survive the teardown and go out on the new link.
    teardown_mark: Option<CommandId>,
    mtu: u16,
    notifying: HashSet<CharacteristicId>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl<T: Transport> SessionCore<T> {
    pub fn new(
        peripheral: PeripheralId,
        settings: Settings,
        transport: T,
        observer: Option<Arc<dyn SessionObserver>>,
        snapshot: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let core = Self {
            connection: ConnectionStateMachine::new(&settings),
            bonding: BondingCoordinator::new(settings.bond_timeout()),
            queue: GattCommandQueue::new(),
            teardown_mark: None,
            peripheral,
            settings,
            transport,
            observer,
            mtu: DEFAULT_MTU,
            notifying: HashSet::new(),
            snapshot,
        };
        core.publish();
        core
    }

    pub fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn bond_state(&self) -> BondState {
        self.bonding.state()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn queue(&self) -> &GattCommandQueue {
        &self.queue
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handle_request(&mut self, request: SessionRequest, now: Instant) {
        match request {
            SessionRequest::Connect => self.connect(now),
            SessionRequest::Disconnect => self.disconnect(now),
            SessionRequest::SetAutoReconnect(enabled) => self.set_auto_reconnect(enabled),
            SessionRequest::Submit {
                request,
                completion,
            } => {
                self.enqueue(request, Some(completion), now);
            }
        }
    }

    pub fn connect(&mut self, now: Instant) {
        match self.connection.request_connect(now) {
            ConnectRequest::Started => self.start_connecting(now),
            ConnectRequest::Deferred => {
                info!("Connect to {} starts after teardown", self.peripheral);
                let last = self.queue.last_id();
                self.teardown_mark.get_or_insert(last);
            }
            ConnectRequest::Ignored => {}
        }
    }

    pub fn disconnect(&mut self, now: Instant) {
        match self.connection.request_disconnect(now) {
            DisconnectRequest::Started => {
                info!("Disconnecting from {}", self.peripheral);
                self.connection_changed(GattStatus::Success);
                if let Err(e) = self.transport.disconnect() {
                    warn!("Transport refused disconnect: {}", e);
                    if let Some(cause) = self.connection.on_disconnected(now) {
                        self.link_down(cause, GattStatus::Success, now);
                    }
                }
            }
            DisconnectRequest::Cancelled => {
                info!("Connect attempt to {} cancelled", self.peripheral);
                self.connection_changed(GattStatus::Success);
                if let Err(e) = self.transport.disconnect() {
                    debug!("Transport refused disconnect: {}", e);
                    if let Some(cause) = self.connection.on_disconnected(now) {
                        self.link_down(cause, GattStatus::Success, now);
                    }
                }
            }
            DisconnectRequest::Ignored => {}
        }
        if !self.connection.connect_pending() {
            self.teardown_mark = None;
        }
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        info!("Auto reconnect {}", if enabled { "enabled" } else { "disabled" });
        self.connection.set_auto_reconnect(enabled);
    }

    /// Queue a command. Dispatch happens immediately if the radio is free.
    pub fn enqueue(
        &mut self,
        request: GattRequest,
        completion: Option<oneshot::Sender<CommandResult>>,
        now: Instant,
    ) -> CommandId {
        debug!("Queueing {}", request);
        let id = self.queue.enqueue(request, completion);
        self.pump(now);
        id
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected => {
                if self.connection.on_connected() {
                    info!("Connected to {}", self.peripheral);
                    self.connection_changed(GattStatus::Success);
                    self.pump(now);
                } else {
                    warn!("Ignoring connected event while {}", self.connection.state());
                    if self.connection.state() == ConnectionState::Disconnected {
                        // A cancelled attempt completed anyway.
                        if let Err(e) = self.transport.disconnect() {
                            debug!("Transport refused disconnect: {}", e);
                        }
                    }
                }
            }
            TransportEvent::Disconnected { status } => {
                if let Some(cause) = self.connection.on_disconnected(now) {
                    self.link_down(cause, status, now);
                }
            }
            TransportEvent::CommandReply {
                token,
                status,
                value,
            } => self.on_reply(token, status, value, now),
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                self.observe(|o, p| o.on_characteristic_update(p, &characteristic, &value));
            }
            TransportEvent::BondStarted => {
                if self.bonding.on_started(now) {
                    self.bond_changed();
                    self.observe(|o, p| o.on_bonding_started(p));
                }
            }
            TransportEvent::BondSucceeded => self.on_bond_succeeded(now),
            TransportEvent::BondFailed => {
                let previous = self.bonding.on_failed();
                self.bond_failed(previous, GattStatus::Failure, now);
            }
            TransportEvent::BondLost => {
                if self.bonding.on_lost() {
                    warn!("Bond with {} lost", self.peripheral);
                    self.bond_changed();
                    self.observe(|o, p| o.on_bond_lost(p));
                }
            }
            TransportEvent::MtuChanged { mtu } => {
                self.mtu = mtu;
                self.publish();
                self.observe(|o, p| o.on_mtu_changed(p, mtu, GattStatus::Success));
            }
            TransportEvent::RssiRead { rssi } => {
                self.observe(|o, p| o.on_rssi_read(p, rssi, GattStatus::Success));
            }
            TransportEvent::PhyUpdated { phy } => {
                self.observe(|o, p| o.on_phy_updated(p, Some(phy), GattStatus::Success));
            }
            TransportEvent::ConnectionParametersUpdated { parameters } => {
                self.observe(|o, p| o.on_connection_parameters_updated(p, &parameters));
            }
        }
    }

    /// Expire whatever deadlines have passed.
    pub fn on_tick(&mut self, now: Instant) {
        if self.bonding.on_deadline(now) {
            self.bond_failed(BondState::Bonding, GattStatus::Timeout, now);
        }

        if let Some(command) = self.queue.take_expired(now) {
            warn!("{} {} timed out", command.id(), command.request());
            self.finish(command, Err(GattStatus::Timeout));
            self.pump(now);
        }

        if let Some(cause) = self.connection.on_deadline(now) {
            warn!("{} timed out ({:?})", self.peripheral, cause);
            if cause == DisconnectCause::ConnectTimeout {
                if let Err(e) = self.transport.disconnect() {
                    debug!("Transport refused disconnect: {}", e);
                }
            }
            self.link_down(cause, GattStatus::Timeout, now);
        }

        if self.connection.take_due_reconnect(now) {
            self.start_connecting(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.queue.deadline(),
            self.bonding.deadline(),
            self.connection.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Tear down when the last handle is gone.
    pub fn shutdown(&mut self) {
        let drained = self.queue.drain();
        if !drained.is_empty() {
            debug!("Session closing with {} outstanding commands", drained.len());
        }
        for command in drained {
            self.finish(command, Err(GattStatus::ConnectionLost));
        }
        if self.connection.state() != ConnectionState::Disconnected {
            if let Err(e) = self.transport.disconnect() {
                debug!("Transport refused disconnect: {}", e);
            }
        }
    }

    fn start_connecting(&mut self, now: Instant) {
        info!("Connecting to {}", self.peripheral);
        self.connection_changed(GattStatus::Success);
        if let Err(e) = self.transport.connect(&self.peripheral) {
            warn!("Transport refused connect: {}", e);
            if let Some(cause) = self.connection.on_disconnected(now) {
                self.link_down(cause, e.status(), now);
            }
        }
    }

    /// The state machine just entered `Disconnected`. Starts a connect that
    /// was deferred during teardown.
    fn link_down(&mut self, cause: DisconnectCause, status: GattStatus, now: Instant) {
        let status = match cause {
            DisconnectCause::Requested | DisconnectCause::Cancelled => GattStatus::Success,
            DisconnectCause::ConnectTimeout | DisconnectCause::TeardownTimeout => {
                GattStatus::Timeout
            }
            DisconnectCause::LinkLoss | DisconnectCause::ConnectFailed => {
                if status.is_success() {
                    GattStatus::ConnectionLost
                } else {
                    status
                }
            }
        };
        info!("Disconnected from {} ({:?}, {})", self.peripheral, cause, status);

        self.mtu = DEFAULT_MTU;
        self.notifying.clear();
        let drained = match self.teardown_mark.take() {
            Some(last) if self.connection.connect_pending() => self.queue.drain_through(last),
            _ => self.queue.drain(),
        };
        self.connection_changed(status);
        for command in drained {
            self.finish(command, Err(GattStatus::ConnectionLost));
        }

        if self.connection.take_pending_connect(now) {
            self.start_connecting(now);
        }
    }

    fn on_reply(
        &mut self,
        token: CorrelationToken,
        status: GattStatus,
        value: ReplyValue,
        now: Instant,
    ) {
        let Some(mut command) = self.queue.complete(token) else {
            debug!("Dropping reply for unknown token {:?} ({})", token, status);
            return;
        };

        if status.requires_bonding() {
            if !command.bonding_attempted() && self.bonding.state() != BondState::Bonded {
                info!("{} {} needs bonding ({})", command.id(), command.request(), status);
                command.mark_bonding_attempted();
                self.queue.hold(command);
                if self.bonding.begin(BondTrigger::Retry, now) {
                    self.bond_changed();
                    self.observe(|o, p| o.on_bonding_started(p));
                    if let Err(e) = self.transport.create_bond() {
                        warn!("Transport refused bonding: {}", e);
                        let previous = self.bonding.on_failed();
                        self.bond_failed(previous, e.status(), now);
                        return;
                    }
                }
                self.publish();
                return;
            }
            warn!(
                "{} {} still unauthenticated, not retrying",
                command.id(),
                command.request()
            );
        }

        let result = if status.is_success() {
            Ok(value)
        } else {
            Err(status)
        };
        self.finish(command, result);
        self.pump(now);
    }

    fn on_bond_succeeded(&mut self, now: Instant) {
        let previous = self.bonding.on_succeeded();
        if previous != BondState::Bonded {
            info!("Bonded with {}", self.peripheral);
            self.bond_changed();
            self.observe(|o, p| o.on_bonding_succeeded(p));
        }
        if let Some(command) = self.queue.complete_bond_request() {
            self.finish(command, Ok(ReplyValue::None));
        }
        if let Some(held) = self.queue.held() {
            info!("Retrying {} {} after bonding", held.id(), held.request());
        }
        self.pump(now);
    }

    /// Bonding ended without a bond. `previous` is the state before the
    /// coordinator recorded the failure.
    fn bond_failed(&mut self, previous: BondState, status: GattStatus, now: Instant) {
        if previous != BondState::NotBonded {
            warn!("Bonding with {} failed ({})", self.peripheral, status);
            self.bond_changed();
            self.observe(|o, p| o.on_bonding_failed(p));
        }
        if let Some(command) = self.queue.complete_bond_request() {
            self.finish(command, Err(status));
        }
        if let Some(held) = self.queue.take_held() {
            self.finish(held, Err(GattStatus::InsufficientAuthentication));
        }
        self.pump(now);
    }

    fn can_dispatch(&self) -> bool {
        self.connection.is_connected()
            && !self.queue.is_in_flight()
            && !self.bonding.blocks_dispatch()
    }

    /// Dispatch queued commands while the gate is open.
    fn pump(&mut self, now: Instant) {
        while self.can_dispatch() {
            let Some(command) = self.queue.pop_ready() else {
                break;
            };
            self.dispatch(command, now);
        }
        self.publish();
    }

    fn dispatch(&mut self, command: GattCommand, now: Instant) {
        let deadline = now + self.settings.command_timeout(command.kind());

        if matches!(command.request(), GattRequest::CreateBond) {
            if self.bonding.state() == BondState::Bonded {
                debug!("{} already bonded", command.id());
                self.finish(command, Ok(ReplyValue::None));
                return;
            }
            debug!("Dispatching {} create bond", command.id());
            self.bonding.begin(BondTrigger::Explicit, now);
            self.queue.start(command, None, deadline);
            self.bond_changed();
            self.observe(|o, p| o.on_bonding_started(p));
            if let Err(e) = self.transport.create_bond() {
                warn!("Transport refused bonding: {}", e);
                let previous = self.bonding.on_failed();
                self.bond_failed(previous, e.status(), now);
            }
            return;
        }

        match self.transport.send(command.request()) {
            Ok(token) => {
                debug!("Dispatched {} {} ({:?})", command.id(), command.request(), token);
                self.queue.start(command, Some(token), deadline);
            }
            Err(e) => {
                warn!("Transport refused {} {}: {}", command.id(), command.request(), e);
                self.finish(command, Err(e.status()));
            }
        }
    }

    /// Resolve a command: apply its side effects, fan out to the observer
    /// and wake the caller.
    fn finish(&mut self, command: GattCommand, result: CommandResult) {
        let status = match &result {
            Ok(_) => GattStatus::Success,
            Err(status) => *status,
        };
        debug!("{} {} resolved: {}", command.id(), command.request(), status);

        match (command.request(), &result) {
            (GattRequest::RequestMtu(_), Ok(ReplyValue::Mtu(mtu))) => self.mtu = *mtu,
            (
                GattRequest::SetNotify {
                    characteristic,
                    mode,
                },
                Ok(_),
            ) => {
                if mode.is_enabled() {
                    self.notifying.insert(characteristic.id);
                } else {
                    self.notifying.remove(&characteristic.id);
                }
            }
            _ => {}
        }
        self.publish();
        self.report(command.request(), &result, status);
        command.resolve(result);
    }

    fn report(&self, request: &GattRequest, result: &CommandResult, status: GattStatus) {
        let bytes: &[u8] = match result {
            Ok(ReplyValue::Bytes(bytes)) => bytes,
            _ => &[],
        };
        match request {
            GattRequest::ReadCharacteristic(c) => {
                self.observe(|o, p| o.on_characteristic_read(p, &c.id, bytes, status));
            }
            GattRequest::WriteCharacteristic {
                characteristic,
                value,
                ..
            } => {
                self.observe(|o, p| o.on_characteristic_write(p, &characteristic.id, value, status));
            }
            GattRequest::ReadDescriptor(d) => {
                self.observe(|o, p| o.on_descriptor_read(p, d, bytes, status));
            }
            GattRequest::WriteDescriptor { descriptor, value } => {
                self.observe(|o, p| o.on_descriptor_write(p, descriptor, value, status));
            }
            GattRequest::SetNotify {
                characteristic,
                mode,
            } => {
                let enabled = mode.is_enabled();
                self.observe(|o, p| {
                    o.on_notification_state_changed(p, &characteristic.id, enabled, status)
                });
            }
            GattRequest::RequestMtu(_) => {
                let mtu = self.mtu;
                self.observe(|o, p| o.on_mtu_changed(p, mtu, status));
            }
            GattRequest::ReadRssi => {
                let rssi = match result {
                    Ok(ReplyValue::Rssi(rssi)) => *rssi,
                    _ => 0,
                };
                self.observe(|o, p| o.on_rssi_read(p, rssi, status));
            }
            GattRequest::RequestConnectionPriority(priority) => {
                self.observe(|o, p| o.on_connection_priority_requested(p, *priority, status));
            }
            GattRequest::SetPreferredPhy { .. } => {
                let phy = match result {
                    Ok(ReplyValue::Phy(phy)) => Some(*phy),
                    _ => None,
                };
                self.observe(|o, p| o.on_phy_updated(p, phy, status));
            }
            // Bond callbacks fire from the bond events themselves.
            GattRequest::CreateBond => {}
        }
    }

    fn connection_changed(&self, status: GattStatus) {
        self.publish();
        let state = self.connection.state();
        self.observe(|o, p| o.on_connection_state_changed(p, state, status));
    }

    fn bond_changed(&self) {
        self.publish();
        let state = self.bonding.state();
        self.observe(|o, p| o.on_bond_state_changed(p, state));
    }

    fn observe<F>(&self, f: F)
    where
        F: FnOnce(&dyn SessionObserver, &PeripheralId),
    {
        if let Some(observer) = &self.observer {
            f(observer.as_ref(), &self.peripheral);
        }
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            connection_state: self.connection.state(),
            bond_state: self.bonding.state(),
            mtu: self.mtu,
            notifying: self.notifying.clone(),
            queued_commands: self.queue.len(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::CommandKind;
    use crate::domain::models::{Characteristic, CharacteristicProperties, NotifyMode, WriteType};
    use crate::infrastructure::simulated::{SimOutcome, SimulatedPeripheral, SimulatedTransport};
    use crate::infrastructure::transport::EventReceiver;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot::error::TryRecvError;
    use uuid::Uuid;

    /// Records callbacks and whether the snapshot already showed the
    /// reported state when each one ran.
    struct RecordingObserver {
        snapshots: watch::Receiver<SessionSnapshot>,
        log: Mutex<Vec<String>>,
        stale: Mutex<usize>,
    }

    impl RecordingObserver {
        fn record(&self, entry: String, fresh: bool) {
            if !fresh {
                *self.stale.lock().unwrap() += 1;
            }
            self.log.lock().unwrap().push(entry);
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn contains(&self, entry: &str) -> bool {
            self.log().iter().any(|e| e == entry)
        }

        fn stale(&self) -> usize {
            *self.stale.lock().unwrap()
        }
    }

    impl SessionObserver for RecordingObserver {
        fn on_connection_state_changed(
            &self,
            _peripheral: &PeripheralId,
            state: ConnectionState,
            status: GattStatus,
        ) {
            let fresh = self.snapshots.borrow().connection_state == state;
            self.record(format!("connection {} {}", state, status), fresh);
        }

        fn on_bond_state_changed(&self, _peripheral: &PeripheralId, state: BondState) {
            let fresh = self.snapshots.borrow().bond_state == state;
            self.record(format!("bond {:?}", state), fresh);
        }

        fn on_bonding_failed(&self, _peripheral: &PeripheralId) {
            self.record("bonding failed".to_string(), true);
        }

        fn on_characteristic_read(
            &self,
            _peripheral: &PeripheralId,
            _characteristic: &CharacteristicId,
            value: &[u8],
            status: GattStatus,
        ) {
            self.record(format!("read {:?} {}", value, status), true);
        }

        fn on_characteristic_update(
            &self,
            _peripheral: &PeripheralId,
            _characteristic: &CharacteristicId,
            value: &[u8],
        ) {
            self.record(format!("update {:?}", value), true);
        }

        fn on_mtu_changed(&self, _peripheral: &PeripheralId, mtu: u16, status: GattStatus) {
            let fresh = self.snapshots.borrow().mtu == mtu;
            self.record(format!("mtu {} {}", mtu, status), fresh);
        }

        fn on_notification_state_changed(
            &self,
            _peripheral: &PeripheralId,
            characteristic: &CharacteristicId,
            enabled: bool,
            status: GattStatus,
        ) {
            let fresh = self.snapshots.borrow().notifying.contains(characteristic) == enabled;
            self.record(format!("notify {} {}", enabled, status), fresh);
        }
    }

    struct Harness {
        core: SessionCore<SimulatedTransport>,
        device: SimulatedPeripheral,
        events: EventReceiver,
        observer: Arc<RecordingObserver>,
        now: Instant,
    }

    impl Harness {
        fn new() -> Self {
            let settings = Settings::default();
            let peripheral = PeripheralId::new("C0:FF:EE:00:00:01", "thermometer");
            let (device, transport, events) = SimulatedPeripheral::new(peripheral.clone());
            device.add_characteristic(&temperature(), &[21]);
            device.add_characteristic(&secret(), &[7, 7]);
            device.protect(&secret());

            let (tx, rx) = watch::channel(SessionSnapshot::default());
            let observer = Arc::new(RecordingObserver {
                snapshots: rx,
                log: Mutex::new(Vec::new()),
                stale: Mutex::new(0),
            });
            let core = SessionCore::new(
                peripheral,
                settings,
                transport,
                Some(observer.clone() as Arc<dyn SessionObserver>),
                tx,
            );
            Self {
                core,
                device,
                events,
                observer,
                now: Instant::now(),
            }
        }

        /// Feed every event the simulator has produced so far.
        fn deliver(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.core.handle_event(event, self.now);
            }
        }

        fn connected() -> Self {
            let mut h = Self::new();
            h.core.connect(h.now);
            h.deliver();
            assert_eq!(h.core.connection_state(), ConnectionState::Connected);
            h
        }

        fn submit(&mut self, request: GattRequest) -> oneshot::Receiver<CommandResult> {
            let (tx, rx) = oneshot::channel();
            self.core.enqueue(request, Some(tx), self.now);
            rx
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.core.on_tick(self.now);
        }
    }

    fn temperature() -> Characteristic {
        Characteristic::new(
            Uuid::from_u128(0x1809),
            Uuid::from_u128(0x2A1C),
            0x0010,
            CharacteristicProperties::READ
                | CharacteristicProperties::WRITE
                | CharacteristicProperties::NOTIFY,
        )
    }

    fn secret() -> Characteristic {
        Characteristic::new(
            Uuid::from_u128(0x1809),
            Uuid::from_u128(0xFFF1),
            0x0020,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
        )
    }

    fn read(c: Characteristic) -> GattRequest {
        GattRequest::ReadCharacteristic(c)
    }

    #[test]
    fn test_commands_dispatch_in_order_one_at_a_time() {
        let mut h = Harness::connected();
        let mut first = h.submit(GattRequest::WriteCharacteristic {
            characteristic: temperature(),
            value: vec![30],
            write_type: WriteType::WithResponse,
        });
        let mut second = h.submit(read(temperature()));
        let mut third = h.submit(GattRequest::ReadRssi);

        assert_eq!(h.core.queue().len(), 3);
        assert!(h.core.queue().is_in_flight());
        assert_eq!(h.device.requests().len(), 1);
        assert_eq!(second.try_recv(), Err(TryRecvError::Empty));

        h.deliver();
        assert_eq!(first.try_recv().unwrap(), Ok(ReplyValue::None));
        assert_eq!(second.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![30])));
        assert_eq!(third.try_recv().unwrap(), Ok(ReplyValue::Rssi(-55)));

        let kinds: Vec<_> = h.device.requests().iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::WriteCharacteristic,
                CommandKind::ReadCharacteristic,
                CommandKind::ReadRssi,
            ]
        );
        assert_eq!(h.device.overlapping_requests(), 0);
        assert!(h.core.queue().is_empty());
    }

    #[test]
    fn test_commands_wait_for_connection() {
        let mut h = Harness::new();
        let mut result = h.submit(read(temperature()));
        assert!(h.device.requests().is_empty());
        assert_eq!(result.try_recv(), Err(TryRecvError::Empty));

        h.core.connect(h.now);
        h.deliver();
        assert_eq!(result.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![21])));
    }

    #[test]
    fn test_timeout_frees_the_radio_and_late_reply_is_dropped() {
        let mut h = Harness::connected();
        h.device.drop_next_replies(1);
        let mut first = h.submit(read(temperature()));
        let mut second = h.submit(GattRequest::ReadRssi);
        h.deliver();

        h.advance(Duration::from_millis(29_999));
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
        h.advance(Duration::from_millis(1));
        assert_eq!(first.try_recv().unwrap(), Err(GattStatus::Timeout));
        assert!(h.observer.contains("read [] timeout"));

        // The reply for the expired request shows up after its successor
        // was dispatched; it must not resolve the successor.
        h.core.handle_event(
            TransportEvent::CommandReply {
                token: CorrelationToken(1),
                status: GattStatus::Success,
                value: ReplyValue::Bytes(vec![99]),
            },
            h.now,
        );
        h.deliver();
        assert_eq!(second.try_recv().unwrap(), Ok(ReplyValue::Rssi(-55)));
    }

    #[test]
    fn test_disconnect_cancels_outstanding_commands() {
        let mut h = Harness::connected();
        h.device.drop_next_replies(1);
        let mut in_flight = h.submit(read(temperature()));
        let mut pending = h.submit(GattRequest::ReadRssi);

        h.core.disconnect(h.now);
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnecting);
        h.deliver();

        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(in_flight.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
        assert_eq!(pending.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
        assert!(h.core.queue().is_empty());
        assert!(h.observer.contains("connection disconnected success"));
        assert!(h.observer.contains("read [] connection lost"));
    }

    #[test]
    fn test_link_loss_resets_mtu_and_subscriptions() {
        let mut h = Harness::connected();
        let mut mtu = h.submit(GattRequest::RequestMtu(247));
        let mut notify = h.submit(GattRequest::SetNotify {
            characteristic: temperature(),
            mode: NotifyMode::Notify,
        });
        h.deliver();
        assert_eq!(mtu.try_recv().unwrap(), Ok(ReplyValue::Mtu(247)));
        assert!(notify.try_recv().unwrap().is_ok());
        assert_eq!(h.core.mtu(), 247);
        assert!(h.core.notifying.contains(&temperature().id));

        h.device.drop_link();
        h.deliver();
        assert_eq!(h.core.mtu(), DEFAULT_MTU);
        assert!(h.core.notifying.is_empty());
        assert!(h.observer.contains("connection disconnected connection lost"));
        assert_eq!(h.observer.stale(), 0);
    }

    #[test]
    fn test_auth_failure_bonds_and_retries_once() {
        let mut h = Harness::connected();
        let mut result = h.submit(read(secret()));
        h.deliver();

        assert_eq!(result.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![7, 7])));
        assert_eq!(h.device.bond_requests(), 1);
        assert_eq!(h.device.requests().len(), 2);
        assert_eq!(h.core.bond_state(), BondState::Bonded);
        assert_eq!(
            h.observer
                .log()
                .iter()
                .filter(|e| e.starts_with("read"))
                .count(),
            1
        );
    }

    #[test]
    fn test_second_auth_failure_is_final() {
        let mut h = Harness::connected();
        h.device.fail_next(GattStatus::InsufficientAuthentication);
        h.device.fail_next(GattStatus::InsufficientEncryption);
        let mut result = h.submit(read(temperature()));
        h.deliver();

        assert_eq!(
            result.try_recv().unwrap(),
            Err(GattStatus::InsufficientEncryption)
        );
        assert_eq!(h.device.bond_requests(), 1);
        assert_eq!(h.device.requests().len(), 2);
        assert_eq!(h.observer.log().iter().filter(|e| e.starts_with("read")).count(), 1);
        assert!(h.observer.contains("read [] insufficient encryption"));
    }

    #[test]
    fn test_failed_bond_resolves_held_command() {
        let mut h = Harness::connected();
        h.device.set_bond_outcome(SimOutcome::Fail);
        let mut protected = h.submit(read(secret()));
        let mut next = h.submit(read(temperature()));
        h.deliver();

        assert_eq!(
            protected.try_recv().unwrap(),
            Err(GattStatus::InsufficientAuthentication)
        );
        assert_eq!(next.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![21])));
        assert_eq!(h.core.bond_state(), BondState::NotBonded);
        assert!(h.observer.contains("bonding failed"));
    }

    #[test]
    fn test_queue_blocked_while_bonding() {
        let mut h = Harness::connected();
        h.device.set_bond_outcome(SimOutcome::Ignore);
        let mut protected = h.submit(read(secret()));
        let mut next = h.submit(read(temperature()));
        h.deliver();

        assert_eq!(h.core.bond_state(), BondState::Bonding);
        assert_eq!(h.device.requests().len(), 1);
        assert_eq!(next.try_recv(), Err(TryRecvError::Empty));

        h.device.finish_remote_bonding(true);
        h.deliver();
        assert_eq!(protected.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![7, 7])));
        assert_eq!(next.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![21])));
    }

    #[test]
    fn test_auth_failure_while_bonded_is_final() {
        let mut h = Harness::connected();
        let mut bond = h.submit(GattRequest::CreateBond);
        h.deliver();
        assert_eq!(bond.try_recv().unwrap(), Ok(ReplyValue::None));
        assert_eq!(h.core.bond_state(), BondState::Bonded);

        h.device.fail_next(GattStatus::InsufficientAuthentication);
        let mut result = h.submit(read(temperature()));
        h.deliver();
        assert_eq!(
            result.try_recv().unwrap(),
            Err(GattStatus::InsufficientAuthentication)
        );
        assert_eq!(h.device.bond_requests(), 1);
    }

    #[test]
    fn test_create_bond_when_bonded_resolves_immediately() {
        let mut h = Harness::connected();
        let _ = h.submit(GattRequest::CreateBond);
        h.deliver();

        let mut again = h.submit(GattRequest::CreateBond);
        assert_eq!(again.try_recv().unwrap(), Ok(ReplyValue::None));
        assert_eq!(h.device.bond_requests(), 1);
    }

    #[test]
    fn test_bond_timeout() {
        let mut h = Harness::connected();
        h.device.set_bond_outcome(SimOutcome::Ignore);
        let mut bond = h.submit(GattRequest::CreateBond);
        h.deliver();
        assert_eq!(h.core.bond_state(), BondState::Bonding);

        h.advance(Duration::from_secs(60));
        assert_eq!(bond.try_recv().unwrap(), Err(GattStatus::Timeout));
        assert_eq!(h.core.bond_state(), BondState::NotBonded);
        assert!(!h.core.queue().is_in_flight());
    }

    #[test]
    fn test_notifications_bypass_the_queue() {
        let mut h = Harness::connected();
        h.device.drop_next_replies(1);
        let _in_flight = h.submit(read(temperature()));
        h.deliver();

        h.device.notify(&temperature().id, &[22]);
        h.deliver();
        assert!(h.observer.contains("update [22]"));
        assert!(h.core.queue().is_in_flight());
    }

    #[test]
    fn test_snapshot_published_before_observers() {
        let mut h = Harness::connected();
        let _ = h.submit(GattRequest::RequestMtu(185));
        let _ = h.submit(GattRequest::SetNotify {
            characteristic: temperature(),
            mode: NotifyMode::Notify,
        });
        let _ = h.submit(GattRequest::CreateBond);
        h.deliver();
        h.device.change_mtu(100);
        h.deliver();

        assert!(h.observer.contains("mtu 185 success"));
        assert!(h.observer.contains("mtu 100 success"));
        assert!(h.observer.contains("notify true success"));
        assert!(h.observer.contains("bond Bonded"));
        assert_eq!(h.observer.stale(), 0);
    }

    #[test]
    fn test_connect_timeout() {
        let mut h = Harness::new();
        h.device.set_connect_outcome(SimOutcome::Ignore);
        let mut pending = h.submit(GattRequest::ReadRssi);
        h.core.connect(h.now);
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Connecting);

        h.advance(Duration::from_secs(30));
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
        assert!(h.observer.contains("connection disconnected timeout"));
        assert_eq!(pending.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
    }

    #[test]
    fn test_connect_failure_drains_queue() {
        let mut h = Harness::new();
        h.device.set_connect_outcome(SimOutcome::Fail);
        let mut pending = h.submit(read(temperature()));
        h.core.connect(h.now);
        h.deliver();

        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(pending.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
        assert!(h.core.queue().is_empty());
        assert!(h.device.requests().is_empty());
        assert!(h.observer.contains("connection disconnected failure"));
        assert!(h.observer.contains("read [] connection lost"));
        assert_eq!(h.core.next_deadline(), None);
    }

    #[test]
    fn test_disconnect_while_connecting_cancels_attempt() {
        let mut h = Harness::new();
        h.device.set_connect_outcome(SimOutcome::Ignore);
        let mut pending = h.submit(read(temperature()));
        h.core.connect(h.now);
        h.core.disconnect(h.now);
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnecting);
        assert_eq!(pending.try_recv(), Err(TryRecvError::Empty));

        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(pending.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
        assert_eq!(h.core.next_deadline(), None);
    }

    #[test]
    fn test_connect_after_cancelled_attempt_ignores_its_events() {
        let mut h = Harness::new();
        h.core.connect(h.now);
        h.core.disconnect(h.now);
        h.core.connect(h.now);
        let mut result = h.submit(read(temperature()));

        // The abandoned attempt's "connected" and the teardown confirmation
        // are still in flight.
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
        assert_eq!(result.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![21])));
        assert!(h.device.is_connected());
        assert!(!h.observer.contains("connection disconnected connection lost"));
    }

    #[test]
    fn test_connect_during_teardown_starts_after_confirmation() {
        let mut h = Harness::connected();
        h.core.disconnect(h.now);
        let mut before = h.submit(read(temperature()));
        h.core.connect(h.now);
        let mut after = h.submit(GattRequest::ReadRssi);
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnecting);

        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
        assert_eq!(before.try_recv().unwrap(), Err(GattStatus::ConnectionLost));
        assert_eq!(after.try_recv().unwrap(), Ok(ReplyValue::Rssi(-55)));
        assert!(h.observer.contains("connection disconnected success"));
        assert!(h.observer.contains("read [] connection lost"));
    }

    #[test]
    fn test_connect_during_unconfirmed_teardown() {
        let mut h = Harness::connected();
        h.device.set_confirm_disconnect(false);
        h.core.disconnect(h.now);
        h.core.connect(h.now);
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnecting);

        h.device.set_confirm_disconnect(true);
        h.advance(Duration::from_secs(5));
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_link_loss_reconnects_with_backoff() {
        let mut h = Harness::connected();
        h.core.set_auto_reconnect(true);

        h.device.drop_link();
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            h.core.next_deadline(),
            Some(h.now + Duration::from_millis(2000))
        );

        h.advance(Duration::from_millis(2000));
        assert_eq!(h.core.connection_state(), ConnectionState::Connecting);
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_teardown_timeout() {
        let mut h = Harness::connected();
        h.device.set_confirm_disconnect(false);
        h.core.disconnect(h.now);
        h.deliver();
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnecting);

        h.advance(Duration::from_secs(5));
        assert_eq!(h.core.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_notify_retried_after_bonding() {
        let mut h = Harness::connected();
        let protected = Characteristic::new(
            Uuid::from_u128(0x1809),
            Uuid::from_u128(0xFFF2),
            0x0030,
            CharacteristicProperties::NOTIFY,
        );
        h.device.add_characteristic(&protected, &[]);
        h.device.protect(&protected);

        let mut result = h.submit(GattRequest::SetNotify {
            characteristic: protected,
            mode: NotifyMode::Notify,
        });
        h.deliver();

        assert_eq!(result.try_recv().unwrap(), Ok(ReplyValue::None));
        assert!(h.core.notifying.contains(&protected.id));
        assert_eq!(h.device.bond_requests(), 1);
        let notify_requests = h
            .device
            .requests()
            .iter()
            .filter(|r| r.kind() == CommandKind::SetNotify)
            .count();
        assert_eq!(notify_requests, 2);
        assert_eq!(
            h.observer
                .log()
                .iter()
                .filter(|e| e.starts_with("notify"))
                .count(),
            1
        );
    }

    #[test]
    fn test_bond_loss_leaves_link_and_queue_alone() {
        let mut h = Harness::connected();
        let _ = h.submit(GattRequest::CreateBond);
        h.deliver();
        h.device.drop_next_replies(1);
        let mut in_flight = h.submit(read(temperature()));

        h.device.lose_bond();
        h.deliver();
        assert_eq!(h.core.bond_state(), BondState::NotBonded);
        assert_eq!(h.core.connection_state(), ConnectionState::Connected);
        assert!(h.core.queue().is_in_flight());
        assert_eq!(in_flight.try_recv(), Err(TryRecvError::Empty));

        // Bonding again on the next protected access.
        let mut protected = h.submit(read(secret()));
        h.advance(Duration::from_secs(30));
        h.deliver();
        assert_eq!(in_flight.try_recv().unwrap(), Err(GattStatus::Timeout));
        assert_eq!(protected.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![7, 7])));
        assert_eq!(h.device.bond_requests(), 2);
    }

    #[test]
    fn test_remote_bonding_blocks_dispatch() {
        let mut h = Harness::connected();
        h.device.start_remote_bonding();
        h.deliver();
        assert_eq!(h.core.bond_state(), BondState::Bonding);

        let mut result = h.submit(read(temperature()));
        assert!(h.device.requests().is_empty());

        h.device.finish_remote_bonding(false);
        h.deliver();
        assert_eq!(h.core.bond_state(), BondState::NotBonded);
        assert_eq!(result.try_recv().unwrap(), Ok(ReplyValue::Bytes(vec![21])));
    }
}
