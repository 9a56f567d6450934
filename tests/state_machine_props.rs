//! Property tests for the simulation lock state machine, driven by clients
//! that follow the lock protocol.

use std::collections::{BTreeSet, HashMap, HashSet};

use proptest::prelude::*;
use weave::runtime::{
    ids::Mpo,
    sim::{ProtocolViolation, Signal, SimMessage, State, StateMachine, Ticket},
};

const CLIENTS: u16 = 3;

#[derive(Clone, Copy, Debug)]
enum Action {
    Read(u16),
    Write(u16),
    Release(u16),
    Clock,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..CLIENTS).prop_map(Action::Read),
        (0..CLIENTS).prop_map(Action::Write),
        (0..CLIENTS).prop_map(Action::Release),
        Just(Action::Clock),
    ]
}

fn arb_batches() -> impl Strategy<Value = Vec<Vec<Action>>> {
    prop::collection::vec(prop::collection::vec(arb_action(), 0..5), 1..30)
}

fn mpo(client: u16) -> Mpo {
    Mpo::new(1, 0, client)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Client {
    Idle,
    Waiting,
    Reading,
    Writing,
}

/// A state machine plus what its clients believe they hold. Tickets carry a
/// unique id so every ack can be traced back to its message.
struct Model {
    machine: StateMachine<u64>,
    clients: Vec<Client>,
    outstanding: HashMap<u64, Option<u16>>,
    acked: HashSet<u64>,
    next_id: u64,
    next_tick: u64,
}

impl Model {
    fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            clients: vec![Client::Idle; CLIENTS as usize],
            outstanding: HashMap::new(),
            acked: HashSet::new(),
            next_id: 0,
            next_tick: 0,
        }
    }

    fn ticket(&mut self, message: SimMessage, client: Option<u16>) -> Ticket<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.outstanding.insert(id, client);
        Ticket { message, reply: id }
    }

    /// Turns actions into messages, skipping whatever a well behaved client
    /// would not send in its current position.
    fn batch(&mut self, actions: &[Action]) -> Vec<Ticket<u64>> {
        let mut batch = Vec::new();
        for &action in actions {
            let idle = |c: u16| self.clients[c as usize] == Client::Idle;
            let holding = |c: u16| {
                matches!(self.clients[c as usize], Client::Reading | Client::Writing)
            };
            let (message, client) = match action {
                Action::Read(c) if idle(c) => (SimMessage::Read(mpo(c)), Some(c)),
                Action::Write(c) if idle(c) => (SimMessage::Write(mpo(c)), Some(c)),
                Action::Release(c) if holding(c) => (SimMessage::Release(mpo(c)), Some(c)),
                Action::Clock => {
                    self.next_tick += 1;
                    (SimMessage::Clock { tick: self.next_tick }, None)
                }
                _ => continue,
            };
            if let Some(c) = client {
                self.clients[c as usize] = Client::Waiting;
            }
            batch.push(self.ticket(message, client));
        }
        batch
    }

    fn step(&mut self, actions: &[Action]) -> Result<(), TestCaseError> {
        let batch = self.batch(actions);
        let signal = self.machine.on_msg(batch);
        self.settle(signal)
    }

    fn settle(
        &mut self,
        signal: Result<Signal, ProtocolViolation>,
    ) -> Result<(), TestCaseError> {
        let signal = signal.map_err(|e| TestCaseError::fail(format!("violation: {e}")))?;
        self.take_acks()?;
        self.check_exclusion()?;
        if let Signal::ClockTick(_) = signal {
            prop_assert_eq!(self.machine.state(), State::Sim);
            self.machine
                .on_cycle()
                .map_err(|e| TestCaseError::fail(format!("violation: {e}")))?;
            // nothing was broadcast, so the move phase ends straight away
            let signal = self.machine.on_msg(Vec::new());
            prop_assert_eq!(signal, Ok(Signal::MoveComplete));
            prop_assert_eq!(self.machine.state(), State::Wait);
            self.take_acks()?;
        }
        Ok(())
    }

    fn take_acks(&mut self) -> Result<(), TestCaseError> {
        for ticket in self.machine.take_acks() {
            prop_assert!(self.acked.insert(ticket.reply), "acked twice: {:?}", ticket);
            let client = self.outstanding.remove(&ticket.reply);
            prop_assert!(client.is_some(), "ack for a message never sent");
            if let Some(Some(c)) = client {
                self.clients[c as usize] = match ticket.message {
                    SimMessage::Read(_) => Client::Reading,
                    SimMessage::Write(_) => Client::Writing,
                    _ => Client::Idle,
                };
            }
        }
        Ok(())
    }

    fn check_exclusion(&self) -> Result<(), TestCaseError> {
        let reads = self.machine.active_reads();
        if let Some(writer) = self.machine.active_write() {
            prop_assert!(
                reads.is_empty() || *reads == BTreeSet::from([writer]),
                "write by {} alongside reads {:?}",
                writer,
                reads
            );
        }
        let reading: BTreeSet<_> = (0..CLIENTS)
            .filter(|&c| self.clients[c as usize] == Client::Reading)
            .map(mpo)
            .collect();
        let writing: Vec<_> = (0..CLIENTS)
            .filter(|&c| self.clients[c as usize] == Client::Writing)
            .map(mpo)
            .collect();
        prop_assert_eq!(reads, &reading);
        prop_assert_eq!(self.machine.active_write(), writing.first().copied());
        prop_assert!(writing.len() <= 1);
        prop_assert!(writing.is_empty() || reading.is_empty());
        Ok(())
    }

    /// Releases everything and keeps the clock going until every message
    /// has been acknowledged.
    fn drain(&mut self) -> Result<(), TestCaseError> {
        let mut actions: Vec<_> = (0..CLIENTS).map(Action::Release).collect();
        actions.push(Action::Clock);
        for _ in 0..100 {
            if self.outstanding.is_empty()
                && self.clients.iter().all(|c| *c == Client::Idle)
            {
                return Ok(());
            }
            self.step(&actions)?;
        }
        prop_assert!(
            false,
            "still outstanding after draining: {:?} in {:?}",
            self.outstanding,
            self.machine.state()
        );
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Never a writer alongside other readers, and the machine always agrees
    /// with its clients about who holds what.
    #[test]
    fn locks_are_exclusive(batches in arb_batches()) {
        let mut model = Model::new();
        for actions in &batches {
            model.step(actions)?;
        }
    }

    /// Every message is acknowledged exactly once, eventually.
    #[test]
    fn every_message_is_acknowledged(batches in arb_batches()) {
        let mut model = Model::new();
        for actions in &batches {
            model.step(actions)?;
        }
        model.drain()?;
        prop_assert_eq!(model.acked.len() as u64, model.next_id);
    }

    /// A sole reader upgrading goes straight to WRITE; anybody else waits.
    #[test]
    fn sole_reader_promotion(reader in 0..CLIENTS, writer in 0..CLIENTS) {
        let mut machine = StateMachine::<()>::new();
        prop_assert_eq!(machine.on_msg(vec![SimMessage::Read(mpo(reader)).into()]), Ok(Signal::Nothing));
        prop_assert_eq!(machine.state(), State::Read);

        let signal = machine.on_msg(vec![SimMessage::Write(mpo(writer)).into()]);
        prop_assert_eq!(signal, Ok(Signal::Nothing));
        if reader == writer {
            prop_assert_eq!(machine.state(), State::Write);
            prop_assert_eq!(machine.active_write(), Some(mpo(reader)));
            prop_assert!(machine.active_reads().is_empty());
            prop_assert_eq!(machine.acks().len(), 1);
        } else {
            prop_assert_eq!(machine.state(), State::Read);
            prop_assert_eq!(machine.active_write(), None);
            prop_assert!(machine.acks().is_empty());
            prop_assert_eq!(machine.queued().len(), 1);
        }
    }

    /// Once terminating, destroys keep being acknowledged and nothing moves.
    #[test]
    fn termination_is_idempotent(
        batches in arb_batches(),
        destroys in prop::collection::vec(any::<bool>(), 1..10),
    ) {
        let mut model = Model::new();
        for actions in &batches {
            model.step(actions)?;
        }
        let destroy = model.ticket(SimMessage::Destroy, None);
        model.machine.on_msg(vec![destroy]).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(model.machine.state(), State::Term);
        prop_assert!(model.machine.queued().is_empty());

        for blocking in destroys {
            let message = if blocking { SimMessage::DestroyBlocking } else { SimMessage::Destroy };
            let ticket = model.ticket(message, None);
            let id = ticket.reply;
            let signal = model.machine.on_msg(vec![ticket]);
            prop_assert_eq!(signal, Ok(Signal::Nothing));
            prop_assert_eq!(model.machine.state(), State::Term);
            let acks = model.machine.take_acks();
            prop_assert_eq!(acks.len(), 1);
            prop_assert_eq!(acks[0].reply, id);
        }
    }
}
