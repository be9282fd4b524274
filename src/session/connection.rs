//! Connection state machine
//!
//! Owns the connect/disconnect lifecycle and the reconnect policy. It never
//! talks to the transport itself: every method reports what happened and
//! the session core performs the side effects.

use crate::domain::models::ConnectionState;
use crate::domain::settings::{ReconnectSettings, Settings};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Why the machine ended up in `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Teardown confirmed after an explicit disconnect.
    Requested,
    /// Explicit disconnect while still connecting.
    Cancelled,
    /// The link dropped without being asked to.
    LinkLoss,
    ConnectFailed,
    ConnectTimeout,
    /// The transport never confirmed an explicit disconnect.
    TeardownTimeout,
}

/// Outcome of an explicit connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRequest {
    /// Already connecting or connected.
    Ignored,
    /// Disconnected → Connecting.
    Started,
    /// Teardown still running; the attempt starts once it is confirmed.
    Deferred,
}

/// Outcome of an explicit disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectRequest {
    Ignored,
    /// Connected → Disconnecting; wait for the transport to confirm.
    Started,
    /// Connecting → Disconnecting; the attempt is abandoned and the
    /// transport must confirm the teardown.
    Cancelled,
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectSettings,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    /// Deadline of the current Connecting or Disconnecting phase.
    deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Current Connecting was started by the reconnect policy.
    reconnect_attempt: bool,
    /// Current Disconnecting abandons a connect attempt.
    cancelling: bool,
    /// Connect requested while Disconnecting.
    connect_pending: bool,
    attempts: u32,
}

impl ConnectionStateMachine {
    pub fn new(settings: &Settings) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy: settings.auto_reconnect.clone(),
            connect_timeout: settings.connect_timeout(),
            disconnect_timeout: settings.disconnect_timeout(),
            deadline: None,
            reconnect_at: None,
            reconnect_attempt: false,
            cancelling: false,
            connect_pending: false,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.policy.enabled
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.policy.enabled = enabled;
        if !enabled {
            self.reconnect_at = None;
        }
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn connect_pending(&self) -> bool {
        self.connect_pending
    }

    pub fn request_connect(&mut self, now: Instant) -> ConnectRequest {
        match self.state {
            ConnectionState::Disconnected => {
                self.start_explicit_connect(now);
                ConnectRequest::Started
            }
            ConnectionState::Disconnecting => {
                debug!("Connect deferred until teardown completes");
                self.connect_pending = true;
                ConnectRequest::Deferred
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("Connect requested while {}", self.state);
                ConnectRequest::Ignored
            }
        }
    }

    /// Start the connect deferred during teardown, once teardown is over.
    pub fn take_pending_connect(&mut self, now: Instant) -> bool {
        if !self.connect_pending || self.state != ConnectionState::Disconnected {
            return false;
        }
        self.start_explicit_connect(now);
        true
    }

    pub fn request_disconnect(&mut self, now: Instant) -> DisconnectRequest {
        match self.state {
            ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                self.deadline = Some(now + self.disconnect_timeout);
                DisconnectRequest::Started
            }
            ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnecting;
                self.deadline = Some(now + self.disconnect_timeout);
                self.cancelling = true;
                self.reconnect_attempt = false;
                self.attempts = 0;
                DisconnectRequest::Cancelled
            }
            ConnectionState::Disconnected => {
                if self.reconnect_at.take().is_some() {
                    info!("Pending reconnect cancelled");
                }
                DisconnectRequest::Ignored
            }
            ConnectionState::Disconnecting => {
                if self.connect_pending {
                    info!("Deferred connect cancelled");
                    self.connect_pending = false;
                }
                DisconnectRequest::Ignored
            }
        }
    }

    /// Connecting → Connected. Stray "connected" events in other states,
    /// including one from an attempt cancelled while it was in progress,
    /// are ignored.
    pub fn on_connected(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.deadline = None;
        self.reconnect_attempt = false;
        self.attempts = 0;
        true
    }

    /// Transport reported the link down.
    pub fn on_disconnected(&mut self, now: Instant) -> Option<DisconnectCause> {
        let cause = match self.state {
            ConnectionState::Disconnected => return None,
            ConnectionState::Connecting => DisconnectCause::ConnectFailed,
            ConnectionState::Connected => DisconnectCause::LinkLoss,
            ConnectionState::Disconnecting if self.cancelling => DisconnectCause::Cancelled,
            ConnectionState::Disconnecting => DisconnectCause::Requested,
        };
        self.enter_disconnected();
        self.after_disconnect(cause, now);
        Some(cause)
    }

    /// Expire a Connecting or Disconnecting phase whose deadline passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<DisconnectCause> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        let cause = match self.state {
            ConnectionState::Connecting => DisconnectCause::ConnectTimeout,
            ConnectionState::Disconnecting => DisconnectCause::TeardownTimeout,
            _ => {
                self.deadline = None;
                return None;
            }
        };
        self.enter_disconnected();
        self.after_disconnect(cause, now);
        Some(cause)
    }

    /// Start a scheduled reconnect whose backoff has elapsed.
    pub fn take_due_reconnect(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now && self.state == ConnectionState::Disconnected => {
                self.reconnect_at = None;
                self.reconnect_attempt = true;
                self.enter_connecting(now);
                info!("Reconnect attempt {}", self.attempts);
                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.deadline, self.reconnect_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn start_explicit_connect(&mut self, now: Instant) {
        self.connect_pending = false;
        self.reconnect_attempt = false;
        self.attempts = 0;
        self.reconnect_at = None;
        self.enter_connecting(now);
    }

    fn enter_connecting(&mut self, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.deadline = Some(now + self.connect_timeout);
    }

    fn enter_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.deadline = None;
        self.cancelling = false;
    }

    fn after_disconnect(&mut self, cause: DisconnectCause, now: Instant) {
        let unsolicited = match cause {
            DisconnectCause::LinkLoss => true,
            DisconnectCause::ConnectFailed | DisconnectCause::ConnectTimeout => {
                self.reconnect_attempt
            }
            _ => false,
        };
        self.reconnect_attempt = false;
        if !unsolicited || !self.policy.enabled || self.connect_pending {
            self.attempts = 0;
            return;
        }
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                info!("Giving up after {} reconnect attempts", self.attempts);
                self.attempts = 0;
                return;
            }
        }
        let backoff = self.backoff();
        self.attempts += 1;
        self.reconnect_at = Some(now + backoff);
        info!("Reconnecting in {:?}", backoff);
    }

    fn backoff(&self) -> Duration {
        let initial = self.policy.initial_backoff_ms;
        let max = self.policy.max_backoff_ms.max(initial);
        let factor = 1u64.checked_shl(self.attempts).unwrap_or(u64::MAX);
        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }
}
