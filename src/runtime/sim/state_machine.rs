use std::{collections::BTreeSet, mem};

use tracing::{debug, trace};

use super::{
    message::{MoveId, SimMessage, Ticket},
    move_machine::{MoveCoordinator, MoveResult},
    ProtocolViolation::{self, *},
};
use crate::runtime::ids::Mpo;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Simulating. Only left through `on_cycle`.
    Sim,
    Move,
    Wait,
    Read,
    Write,
    Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Nothing,
    /// The clock was released; the simulation may run its next step.
    ClockTick(u64),
    /// Every move request this process broadcast has been answered.
    MoveComplete,
}

/// Arbitrates read and write locks on a simulation between the MPOs that want
/// to touch it, and decides when the clock may move on.
///
/// Each call to [`StateMachine::on_msg`] takes a batch of newly arrived
/// messages. Whatever can be handled in the current state ends up in
/// [`StateMachine::acks`], everything else stays queued for a later call. The
/// `R` carried by every [`Ticket`] comes back out with its ack, so callers can
/// attach whatever they need to answer the sender.
///
/// Not thread safe. Drive it from a single task.
pub struct StateMachine<R = ()> {
    state: State,
    acks: Vec<Ticket<R>>,
    queue: Vec<Ticket<R>>,
    active_reads: BTreeSet<Mpo>,
    active_write: Option<Mpo>,
    /// MPOs granted a lock after termination began. Not exclusive, but still
    /// expected to release.
    term_grants: BTreeSet<Mpo>,
    moves: MoveCoordinator,
}

impl<R> Default for StateMachine<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> StateMachine<R> {
    pub fn new() -> Self {
        Self {
            state: State::Wait,
            acks: Vec::new(),
            queue: Vec::new(),
            active_reads: BTreeSet::new(),
            active_write: None,
            term_grants: BTreeSet::new(),
            moves: MoveCoordinator::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Messages handled by the last `on_msg` call.
    pub fn acks(&self) -> &[Ticket<R>] {
        &self.acks
    }

    pub fn take_acks(&mut self) -> Vec<Ticket<R>> {
        mem::take(&mut self.acks)
    }

    /// Messages deferred until the state allows them.
    pub fn queued(&self) -> &[Ticket<R>] {
        &self.queue
    }

    pub fn active_reads(&self) -> &BTreeSet<Mpo> {
        &self.active_reads
    }

    pub fn active_write(&self) -> Option<Mpo> {
        self.active_write
    }

    /// MPOs holding a lock granted while terminating.
    pub fn term_grants(&self) -> &BTreeSet<Mpo> {
        &self.term_grants
    }

    pub fn moves(&self) -> &MoveCoordinator {
        &self.moves
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Term
            && self.active_reads.is_empty()
            && self.active_write.is_none()
            && self.term_grants.is_empty()
            && self.acks.is_empty()
    }

    /// Starts the next cycle once the simulation has stepped.
    pub fn on_cycle(&mut self) -> Result<(), ProtocolViolation> {
        if self.state != State::Sim {
            Err(CycleOutsideSim(self.state))?
        }
        self.state = State::Move;
        self.moves.begin();
        Ok(())
    }

    /// Records the move requests this process broadcast for the current
    /// cycle. See [`MoveCoordinator::register_own`].
    pub fn register_own_moves(&mut self, ids: impl IntoIterator<Item = MoveId>) {
        self.moves.register_own(ids);
    }

    /// See [`MoveCoordinator::send_move_requests`].
    pub fn send_move_requests(&mut self) -> bool {
        self.moves.send_move_requests()
    }

    pub fn on_msg(
        &mut self,
        msgs: Vec<Ticket<R>>,
    ) -> Result<Signal, ProtocolViolation> {
        self.acks.clear();

        if self.state != State::Term
            && msgs.iter().any(|ticket| ticket.message.is_destroy())
        {
            debug!(from = ?self.state, "terminating");
            self.state = State::Term;
        }

        if self.state == State::Sim {
            return match msgs.into_iter().next() {
                Some(ticket) => Err(MessageWhileSimulating(ticket.message)),
                None => Ok(Signal::Nothing),
            };
        }

        self.queue.extend(msgs);

        // keep going while the state changes, so work unblocked by a
        // transition is done in the same call
        loop {
            let before = self.state;
            let signal = match before {
                State::Sim => Signal::Nothing,
                State::Move => self.on_move()?,
                State::Wait => self.on_wait()?,
                State::Read => self.on_read()?,
                State::Write => self.on_write()?,
                State::Term => self.on_term()?,
            };
            if signal != Signal::Nothing
                || self.state == before
                || self.state == State::Sim
            {
                return Ok(signal);
            }
            trace!(from = ?before, to = ?self.state, "transition");
        }
    }

    fn on_move(&mut self) -> Result<Signal, ProtocolViolation> {
        match self.route_moves()? {
            MoveResult::Nothing => Ok(Signal::Nothing),
            MoveResult::MoveRequestsComplete => {
                self.state = State::Wait;
                Ok(Signal::MoveComplete)
            }
            MoveResult::ProcessMoveComplete => {
                self.state = State::Wait;
                Ok(Signal::Nothing)
            }
        }
    }

    fn on_wait(&mut self) -> Result<Signal, ProtocolViolation> {
        self.route_moves()?;

        let reads = self.take_queued(|m| matches!(m, SimMessage::Read(_)));
        if !reads.is_empty() {
            for ticket in &reads {
                if let SimMessage::Read(mpo) = ticket.message {
                    self.active_reads.insert(mpo);
                }
            }
            self.acks.extend(reads);
            self.state = State::Read;
            return Ok(Signal::Nothing);
        }

        let write = self
            .queue
            .iter()
            .position(|t| matches!(t.message, SimMessage::Write(_)));
        if let Some(pos) = write {
            let ticket = self.queue.remove(pos);
            if let SimMessage::Write(mpo) = ticket.message {
                self.active_write = Some(mpo);
            }
            self.acks.push(ticket);
            self.state = State::Write;
            return Ok(Signal::Nothing);
        }

        // nothing is locked in WAIT
        for ticket in &self.queue {
            if let SimMessage::Release(mpo) = ticket.message {
                Err(UnmatchedRelease(mpo))?
            }
        }

        Ok(self.tick().unwrap_or(Signal::Nothing))
    }

    fn on_read(&mut self) -> Result<Signal, ProtocolViolation> {
        self.route_moves()?;

        if self.active_reads.is_empty() {
            if let Some(signal) = self.tick() {
                return Ok(signal);
            }
        }

        let locking = self.take_queued(|m| {
            matches!(m, SimMessage::Read(_) | SimMessage::Release(_))
        });
        for ticket in locking {
            match ticket.message {
                SimMessage::Read(mpo) => {
                    self.active_reads.insert(mpo);
                }
                SimMessage::Release(mpo) => {
                    if !self.active_reads.remove(&mpo) {
                        Err(UnmatchedRelease(mpo))?
                    }
                }
                _ => {}
            }
            self.acks.push(ticket);
        }

        // a sole reader may upgrade in place
        if self.active_reads.len() == 1 {
            if let Some(&reader) = self.active_reads.first() {
                let upgrade = self
                    .queue
                    .iter()
                    .position(|t| t.message == SimMessage::Write(reader));
                if let Some(pos) = upgrade {
                    let ticket = self.queue.remove(pos);
                    self.active_reads.clear();
                    self.active_write = Some(reader);
                    self.acks.push(ticket);
                    self.state = State::Write;
                }
            }
        }

        Ok(Signal::Nothing)
    }

    fn on_write(&mut self) -> Result<Signal, ProtocolViolation> {
        self.route_moves()?;

        if self.active_write.is_none() {
            if let Some(signal) = self.tick() {
                return Ok(signal);
            }
        }

        let releases =
            self.take_queued(|m| matches!(m, SimMessage::Release(_)));
        for ticket in releases {
            if let SimMessage::Release(mpo) = ticket.message {
                if self.active_write != Some(mpo) {
                    Err(UnmatchedRelease(mpo))?
                }
                self.active_write = None;
            }
            self.acks.push(ticket);
        }

        let mut deferred = Vec::new();
        for ticket in mem::take(&mut self.queue) {
            match ticket.message {
                SimMessage::Write(mpo) if self.active_write.is_none() => {
                    self.active_write = Some(mpo);
                    self.acks.push(ticket);
                }
                SimMessage::Write(mpo) | SimMessage::Read(mpo)
                    if self.active_write == Some(mpo) =>
                {
                    self.acks.push(ticket);
                }
                _ => deferred.push(ticket),
            }
        }
        self.queue = deferred;

        Ok(Signal::Nothing)
    }

    fn on_term(&mut self) -> Result<Signal, ProtocolViolation> {
        let mut tick = None;
        for ticket in mem::take(&mut self.queue) {
            match ticket.message {
                SimMessage::Read(mpo) | SimMessage::Write(mpo)
                    if !self.active_reads.contains(&mpo)
                        && self.active_write != Some(mpo) =>
                {
                    self.term_grants.insert(mpo);
                }
                SimMessage::Release(mpo) => {
                    // one release lets go of everything the MPO holds
                    let read = self.active_reads.remove(&mpo);
                    let wrote = self.active_write == Some(mpo);
                    if wrote {
                        self.active_write = None;
                    }
                    let granted = self.term_grants.remove(&mpo);
                    if !(read || wrote || granted) {
                        Err(UnmatchedRelease(mpo))?
                    }
                }
                SimMessage::Clock { tick: value } => {
                    tick = tick.max(Some(value));
                }
                _ => {}
            }
            self.acks.push(ticket);
        }
        Ok(tick.map_or(Signal::Nothing, Signal::ClockTick))
    }

    /// Hands queued move traffic to the coordinator. Move messages are
    /// always acknowledged, whatever the state.
    fn route_moves(&mut self) -> Result<MoveResult, ProtocolViolation> {
        let tickets = self.take_queued(SimMessage::is_move);
        let msgs: Vec<_> = tickets.iter().map(|t| t.message.clone()).collect();
        let result = self.moves.on_msg(&msgs)?;
        self.acks.extend(tickets);
        Ok(result)
    }

    /// Releases the clock if one is queued. Pending clock messages collapse
    /// into a single tick.
    fn tick(&mut self) -> Option<Signal> {
        let clocks =
            self.take_queued(|m| matches!(m, SimMessage::Clock { .. }));
        let tick = clocks
            .iter()
            .filter_map(|t| match t.message {
                SimMessage::Clock { tick } => Some(tick),
                _ => None,
            })
            .max()?;
        self.acks.extend(clocks);
        self.state = State::Sim;
        Some(Signal::ClockTick(tick))
    }

    fn take_queued(
        &mut self,
        pred: impl Fn(&SimMessage) -> bool,
    ) -> Vec<Ticket<R>> {
        let (taken, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.queue)
            .into_iter()
            .partition(|t| pred(&t.message));
        self.queue = kept;
        taken
    }
}
