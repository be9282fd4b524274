//! GATT command queue
//!
//! FIFO of pending commands plus the single in-flight slot. The queue only
//! tracks ownership; whether dispatch is allowed is decided by the session
//! core, which consults the connection and bonding state.

use crate::domain::command::{CommandId, CommandResult, GattCommand, GattRequest};
use crate::infrastructure::transport::CorrelationToken;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// The command currently owning the radio.
#[derive(Debug)]
struct InFlight {
    command: GattCommand,
    /// `None` for bond requests, which are answered by bond events.
    token: Option<CorrelationToken>,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct GattCommandQueue {
    pending: VecDeque<GattCommand>,
    in_flight: Option<InFlight>,
    /// Command parked while a bonding retry runs. Redispatched ahead of
    /// `pending` once the bond completes.
    held: Option<GattCommand>,
    next_id: u64,
}

impl GattCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a request into a command at the back of the queue.
    pub fn enqueue(
        &mut self,
        request: GattRequest,
        completion: Option<oneshot::Sender<CommandResult>>,
    ) -> CommandId {
        self.next_id += 1;
        let id = CommandId(self.next_id);
        self.pending.push_back(GattCommand::new(id, request, completion));
        id
    }

    /// Id of the most recently enqueued command.
    pub fn last_id(&self) -> CommandId {
        CommandId(self.next_id)
    }

    pub fn currently_dispatching(&self) -> Option<&GattCommand> {
        self.in_flight.as_ref().map(|f| &f.command)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn held(&self) -> Option<&GattCommand> {
        self.held.as_ref()
    }

    /// Commands not yet resolved: pending, held and in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
            + usize::from(self.held.is_some())
            + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether something is waiting to be dispatched.
    pub fn has_ready(&self) -> bool {
        self.held.is_some() || !self.pending.is_empty()
    }

    /// Next command to dispatch; a held retry goes first.
    pub fn pop_ready(&mut self) -> Option<GattCommand> {
        self.held.take().or_else(|| self.pending.pop_front())
    }

    /// Hand the radio to `command`.
    ///
    /// The slot must be free; callers check [`Self::is_in_flight`] first.
    pub fn start(
        &mut self,
        command: GattCommand,
        token: Option<CorrelationToken>,
        deadline: Instant,
    ) {
        debug_assert!(self.in_flight.is_none(), "second command dispatched");
        self.in_flight = Some(InFlight {
            command,
            token,
            deadline,
        });
    }

    /// Release the slot if `token` belongs to the in-flight command.
    pub fn complete(&mut self, token: CorrelationToken) -> Option<GattCommand> {
        match &self.in_flight {
            Some(f) if f.token == Some(token) => self.in_flight.take().map(|f| f.command),
            _ => None,
        }
    }

    /// Release the slot if it is held by a bond request.
    pub fn complete_bond_request(&mut self) -> Option<GattCommand> {
        match &self.in_flight {
            Some(f) if matches!(f.command.request(), GattRequest::CreateBond) => {
                self.in_flight.take().map(|f| f.command)
            }
            _ => None,
        }
    }

    /// Release the slot if its deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<GattCommand> {
        match &self.in_flight {
            Some(f) if f.deadline <= now => self.in_flight.take().map(|f| f.command),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Park a command until bonding completes.
    pub fn hold(&mut self, command: GattCommand) {
        debug_assert!(self.held.is_none(), "two commands held for bonding");
        self.held = Some(command);
    }

    pub fn take_held(&mut self) -> Option<GattCommand> {
        self.held.take()
    }

    /// Remove every command, in-flight first, then held, then pending in
    /// order.
    pub fn drain(&mut self) -> Vec<GattCommand> {
        let mut drained = Vec::with_capacity(self.len());
        if let Some(f) = self.in_flight.take() {
            drained.push(f.command);
        }
        if let Some(held) = self.held.take() {
            drained.push(held);
        }
        drained.extend(self.pending.drain(..));
        drained
    }

    /// Like [`Self::drain`], but pending commands enqueued after `last`
    /// stay queued.
    pub fn drain_through(&mut self, last: CommandId) -> Vec<GattCommand> {
        let keep = self.pending.iter().take_while(|c| c.id() <= last).count();
        let mut drained = Vec::with_capacity(keep + 2);
        if let Some(f) = self.in_flight.take() {
            drained.push(f.command);
        }
        if let Some(held) = self.held.take() {
            drained.push(held);
        }
        drained.extend(self.pending.drain(..keep));
        drained
    }
}
