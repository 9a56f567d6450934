use thiserror::Error;

use super::ids::Mpo;

pub mod driver;
pub mod message;
pub mod move_machine;
pub mod state_machine;

pub use driver::{spawn_simulation, Simulation, SimulationHandle};
pub use message::{MoveId, SimMessage, Ticket};
pub use move_machine::{MoveCoordinator, MoveResult};
pub use state_machine::{Signal, State, StateMachine};

/// A peer or this process broke the lock protocol. The state machine can't be
/// trusted after one of these, so whoever drives it stops.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("received {0:?} while simulating")]
    MessageWhileSimulating(SimMessage),
    #[error("release from {0} without a matching lock")]
    UnmatchedRelease(Mpo),
    #[error("move complete received while still broadcasting move requests")]
    MoveCompleteWhileBroadcasting,
    #[error("{0:?} is not a move message")]
    NotAMoveMessage(SimMessage),
    #[error("cycle started in {0:?} rather than SIM")]
    CycleOutsideSim(State),
}
