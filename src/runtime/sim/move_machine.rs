use hashbrown::HashSet;
use tracing::{trace, warn};

use super::{
    message::{MoveId, SimMessage},
    ProtocolViolation,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveResult {
    Nothing,
    /// Every move request this process broadcast has been answered.
    MoveRequestsComplete,
    /// The rest of the cluster reported that moving is done.
    ProcessMoveComplete,
}

/// Tracks outstanding move requests for one simulation so the clock is only
/// released once everybody has finished moving.
#[derive(Debug, Default)]
pub struct MoveCoordinator {
    /// requests this process broadcast itself
    own: HashSet<MoveId>,
    /// requests passed through on behalf of other processes
    forwarded: HashSet<MoveId>,
    broadcasting: bool,
}

impl MoveCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the broadcast phase of a cycle. The phase completes once every
    /// request registered with [`MoveCoordinator::register_own`] is answered.
    pub fn begin(&mut self) {
        if !self.own.is_empty() {
            warn!(
                pending = self.own.len(),
                "starting a move phase with requests outstanding"
            );
        }
        self.broadcasting = true;
    }

    /// Records move requests this process broadcast. Only these hold the
    /// broadcast phase open; requests arriving through `on_msg` always come
    /// from other processes.
    pub fn register_own(&mut self, ids: impl IntoIterator<Item = MoveId>) {
        for id in ids {
            trace!(id, "own move request");
            if self.forwarded.contains(&id) {
                warn!(id, "own move request already seen from a peer");
            }
            self.own.insert(id);
        }
    }

    /// Marks the local simulation as done broadcasting. Outstanding own
    /// requests then resolve through the cluster wide move complete instead
    /// of local completion. Returns whether any requests are still out.
    pub fn send_move_requests(&mut self) -> bool {
        self.broadcasting = false;
        !self.own.is_empty()
    }

    pub fn on_msg(
        &mut self,
        msgs: &[SimMessage],
    ) -> Result<MoveResult, ProtocolViolation> {
        let mut result = MoveResult::Nothing;
        for msg in msgs {
            match msg {
                SimMessage::MoveComplete => {
                    if self.broadcasting {
                        Err(ProtocolViolation::MoveCompleteWhileBroadcasting)?
                    }
                    result = MoveResult::ProcessMoveComplete;
                }
                SimMessage::MoveRequest { id } => {
                    trace!(id, "forwarded move request");
                    self.forwarded.insert(*id);
                }
                SimMessage::MoveResponse { id } => {
                    if !self.own.remove(id) && !self.forwarded.remove(id) {
                        warn!(id, "response for unknown move request");
                    }
                }
                other => {
                    Err(ProtocolViolation::NotAMoveMessage(other.clone()))?
                }
            }
        }

        if self.broadcasting && self.own.is_empty() {
            self.broadcasting = false;
            result = MoveResult::MoveRequestsComplete;
        }
        Ok(result)
    }

    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting
    }

    pub fn own_pending(&self) -> usize {
        self.own.len()
    }

    pub fn forwarded_pending(&self) -> usize {
        self.forwarded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once_own_requests_drain() {
        let mut moves = MoveCoordinator::new();
        moves.begin();
        moves.register_own(1..=3);
        assert_eq!(moves.on_msg(&[]).unwrap(), MoveResult::Nothing);
        assert_eq!(moves.own_pending(), 3);

        for id in 1..=2 {
            let res = moves.on_msg(&[SimMessage::MoveResponse { id }]);
            assert_eq!(res.unwrap(), MoveResult::Nothing);
        }
        let res = moves.on_msg(&[SimMessage::MoveResponse { id: 3 }]);
        assert_eq!(res.unwrap(), MoveResult::MoveRequestsComplete);
        assert!(!moves.is_broadcasting());
    }

    #[test]
    fn nothing_to_broadcast_completes_immediately() {
        let mut moves = MoveCoordinator::new();
        moves.begin();
        assert_eq!(moves.on_msg(&[]).unwrap(), MoveResult::MoveRequestsComplete);
    }

    #[test]
    fn requests_outside_a_broadcast_are_forwarded() {
        let mut moves = MoveCoordinator::new();
        moves.on_msg(&[SimMessage::MoveRequest { id: 7 }]).unwrap();
        assert_eq!(moves.forwarded_pending(), 1);
        assert_eq!(moves.own_pending(), 0);
        moves.on_msg(&[SimMessage::MoveResponse { id: 7 }]).unwrap();
        assert_eq!(moves.forwarded_pending(), 0);
    }

    #[test]
    fn peer_requests_during_a_broadcast_stay_forwarded() {
        let mut moves = MoveCoordinator::new();
        moves.begin();
        moves.register_own([1]);
        let res = moves.on_msg(&[SimMessage::MoveRequest { id: 99 }]);
        assert_eq!(res.unwrap(), MoveResult::Nothing);
        assert_eq!(moves.own_pending(), 1);
        assert_eq!(moves.forwarded_pending(), 1);

        // answering our own request finishes the phase, the peer's doesn't
        // have to be
        let res = moves.on_msg(&[SimMessage::MoveResponse { id: 1 }]);
        assert_eq!(res.unwrap(), MoveResult::MoveRequestsComplete);
        assert_eq!(moves.forwarded_pending(), 1);
    }

    #[test]
    fn process_complete_only_after_broadcast() {
        let mut moves = MoveCoordinator::new();
        moves.begin();
        moves.register_own([9]);
        assert_eq!(
            moves.on_msg(&[SimMessage::MoveComplete]),
            Err(ProtocolViolation::MoveCompleteWhileBroadcasting)
        );

        assert!(moves.send_move_requests());
        assert!(!moves.is_broadcasting());
        assert_eq!(
            moves.on_msg(&[SimMessage::MoveComplete]).unwrap(),
            MoveResult::ProcessMoveComplete
        );
    }

    #[test]
    fn handing_off_with_nothing_outstanding() {
        let mut moves = MoveCoordinator::new();
        moves.begin();
        assert!(!moves.send_move_requests());
        assert_eq!(moves.on_msg(&[]).unwrap(), MoveResult::Nothing);
    }
}
