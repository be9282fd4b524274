//! Bonding coordinator
//!
//! Tracks the bond sub-state. While `Bonding`, GATT dispatch is blocked.

use crate::domain::models::BondState;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Who started the current bonding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondTrigger {
    /// A queued create-bond command.
    Explicit,
    /// A command failed with insufficient authentication/encryption.
    Retry,
    /// The stack or the peripheral initiated pairing.
    Remote,
}

#[derive(Debug)]
pub struct BondingCoordinator {
    state: BondState,
    trigger: Option<BondTrigger>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl BondingCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: BondState::NotBonded,
            trigger: None,
            deadline: None,
            timeout,
        }
    }

    pub fn state(&self) -> BondState {
        self.state
    }

    /// Bonding and GATT traffic are mutually exclusive.
    pub fn blocks_dispatch(&self) -> bool {
        self.state == BondState::Bonding
    }

    pub fn trigger(&self) -> Option<BondTrigger> {
        self.trigger
    }

    /// Enter `Bonding`. Returns false when an attempt is already running,
    /// in which case the caller joins it instead of starting another.
    pub fn begin(&mut self, trigger: BondTrigger, now: Instant) -> bool {
        if self.state == BondState::Bonding {
            debug!("Bonding already in progress ({:?})", self.trigger);
            return false;
        }
        info!("Bonding started ({:?})", trigger);
        self.state = BondState::Bonding;
        self.trigger = Some(trigger);
        self.deadline = Some(now + self.timeout);
        true
    }

    /// Transport reported bond-started.
    pub fn on_started(&mut self, now: Instant) -> bool {
        self.begin(BondTrigger::Remote, now)
    }

    /// Returns the previous state.
    pub fn on_succeeded(&mut self) -> BondState {
        let previous = self.state;
        self.state = BondState::Bonded;
        self.trigger = None;
        self.deadline = None;
        previous
    }

    /// Returns the previous state.
    pub fn on_failed(&mut self) -> BondState {
        let previous = self.state;
        if previous != BondState::Bonding {
            warn!("Bond failure reported while {:?}", previous);
        }
        self.state = BondState::NotBonded;
        self.trigger = None;
        self.deadline = None;
        previous
    }

    /// Bonded → NotBonded. Has no effect in any other state.
    pub fn on_lost(&mut self) -> bool {
        if self.state != BondState::Bonded {
            return false;
        }
        self.state = BondState::NotBonded;
        true
    }

    /// Abandon an attempt that outlived its deadline.
    pub fn on_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now && self.state == BondState::Bonding => {
                warn!("Bonding timed out");
                self.on_failed();
                true
            }
            _ => false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
