use std::sync::Arc;

use futures::FutureExt;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, trace};

use super::{
    message::{MoveId, SimMessage, Ticket},
    state_machine::{Signal, State, StateMachine},
};
use crate::runtime::{
    ids::LogicalThreadId,
    net::error::Error,
    thread::{inbox::Inbound, LogicalThread, LogicalThreadManager, NoRequests},
};

/// The simulation a driver steps forward.
pub trait Simulation: Send + 'static {
    /// Runs one step at `tick`. Returns the ids of the move requests this
    /// process broadcast while stepping.
    fn on_clock_tick(&mut self, tick: u64) -> Vec<MoveId>;

    /// Every move request broadcast for the current step was answered.
    fn on_move_complete(&mut self) {}

    fn on_terminated(&mut self) {}
}

type Reply = Option<oneshot::Sender<()>>;

/// Submits lock traffic to a running simulation driver. Cloning it is cheap.
#[derive(Clone)]
pub struct SimulationHandle {
    thread_id: LogicalThreadId,
    tx: mpsc::UnboundedSender<Ticket<Reply>>,
}

impl SimulationHandle {
    /// The logical thread the driver runs on.
    pub fn thread_id(&self) -> LogicalThreadId {
        self.thread_id
    }

    /// Resolves once the state machine has acknowledged `message`. A read or
    /// write therefore returns holding the lock.
    pub async fn submit(&self, message: SimMessage) -> Result<(), Error> {
        let (reply, acked) = oneshot::channel();
        self.tx
            .send(Ticket {
                message,
                reply: Some(reply),
            })
            .map_err(|_| Error::SimulationStopped)?;
        acked.await.map_err(|_| Error::SimulationStopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Starts a driver for `simulation` on a logical thread of its own. The join
/// handle yields once the simulation has terminated, or with the protocol
/// violation that stopped it.
pub async fn spawn_simulation(
    manager: &Arc<LogicalThreadManager>,
    simulation: impl Simulation,
) -> (SimulationHandle, JoinHandle<Result<(), Error>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = Driver {
        simulation,
        machine: StateMachine::new(),
        rx,
        blocked: Vec::new(),
    };
    let (thread_id, join) = manager
        .initiate(Arc::new(NoRequests), move |thread| {
            driver.run(thread).boxed()
        })
        .await;
    (SimulationHandle { thread_id, tx }, join)
}

enum Next {
    Ticket(Option<Ticket<Reply>>),
    Inbound(Option<Inbound>),
}

struct Driver<S> {
    simulation: S,
    machine: StateMachine<Reply>,
    rx: mpsc::UnboundedReceiver<Ticket<Reply>>,
    /// Blocking destroys, answered once termination completes.
    blocked: Vec<oneshot::Sender<()>>,
}

impl<S: Simulation> Driver<S> {
    async fn run(mut self, thread: &mut LogicalThread) -> Result<(), Error> {
        debug!("simulation started");
        loop {
            let next = select! {
                ticket = self.rx.recv() => Next::Ticket(ticket),
                inbound = thread.next_inbound() => Next::Inbound(inbound),
            };
            let mut batch = match next {
                Next::Ticket(Some(ticket)) => vec![ticket],
                Next::Ticket(None) => {
                    debug!("every handle dropped, stopping");
                    return Ok(());
                }
                Next::Inbound(Some(inbound)) => {
                    thread.process(inbound).await;
                    continue;
                }
                Next::Inbound(None) => return Err(Error::QueueClosed),
            };
            while let Ok(ticket) = self.rx.try_recv() {
                batch.push(ticket);
            }

            self.step(batch)?;

            if self.machine.is_terminated() {
                for reply in self.blocked.drain(..) {
                    let _ = reply.send(());
                }
                debug!("simulation terminated");
                self.simulation.on_terminated();
                return Ok(());
            }
        }
    }

    /// Feeds one batch through the state machine, then keeps going for as
    /// long as its signals produce more work.
    fn step(&mut self, mut batch: Vec<Ticket<Reply>>) -> Result<(), Error> {
        loop {
            let signal = match self.machine.on_msg(batch) {
                Ok(signal) => signal,
                Err(violation) => {
                    error!(state = ?self.machine.state(), "protocol violation: {violation}");
                    Err(violation)?
                }
            };
            let progressed = self.acknowledge();
            batch = match signal {
                Signal::ClockTick(tick) if self.machine.state() == State::Sim => {
                    debug!(tick, "clock tick");
                    let moves = self.simulation.on_clock_tick(tick);
                    self.machine.on_cycle()?;
                    trace!(moves = moves.len(), "move requests broadcast");
                    self.machine.register_own_moves(moves);
                    Vec::new()
                }
                Signal::ClockTick(tick) => {
                    trace!(tick, "clock released while terminating");
                    return Ok(());
                }
                Signal::MoveComplete => {
                    debug!("moves complete");
                    self.simulation.on_move_complete();
                    Vec::new()
                }
                // a release can unblock a clock queued behind it, which is
                // only looked at on the next call
                Signal::Nothing if progressed && !self.machine.queued().is_empty() => {
                    Vec::new()
                }
                Signal::Nothing => return Ok(()),
            };
        }
    }

    /// Answers everything the last call handled. Returns whether there was
    /// anything.
    fn acknowledge(&mut self) -> bool {
        let acks = self.machine.take_acks();
        let any = !acks.is_empty();
        for ticket in acks {
            let Some(reply) = ticket.reply else {
                continue;
            };
            if ticket.message == SimMessage::DestroyBlocking {
                self.blocked.push(reply);
            } else {
                let _ = reply.send(());
            }
        }
        any
    }
}
