use rkyv::{Archive, Deserialize, Serialize};

use crate::runtime::ids::Mpo;

pub type MoveId = u64;

/// Messages consumed by the simulation lock state machine.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum SimMessage {
    Read(Mpo),
    Write(Mpo),
    Release(Mpo),
    Destroy,
    /// Like `Destroy`, but only acknowledged once the simulation has fully
    /// terminated.
    DestroyBlocking,
    Clock { tick: u64 },
    MoveRequest { id: MoveId },
    MoveResponse { id: MoveId },
    MoveComplete,
}

impl SimMessage {
    pub fn is_destroy(&self) -> bool {
        matches!(self, SimMessage::Destroy | SimMessage::DestroyBlocking)
    }

    pub fn is_move(&self) -> bool {
        matches!(
            self,
            SimMessage::MoveRequest { .. }
                | SimMessage::MoveResponse { .. }
                | SimMessage::MoveComplete
        )
    }
}

/// A message waiting on the state machine, together with whatever the caller
/// needs to acknowledge it once it's handled.
#[derive(Debug)]
pub struct Ticket<R = ()> {
    pub message: SimMessage,
    pub reply: R,
}

impl Ticket<()> {
    pub fn new(message: SimMessage) -> Self {
        Self { message, reply: () }
    }
}

impl From<SimMessage> for Ticket<()> {
    fn from(message: SimMessage) -> Self {
        Self::new(message)
    }
}
