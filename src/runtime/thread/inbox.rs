use futures::{channel::mpsc as local, FutureExt, StreamExt};
use tokio::sync::mpsc;

use crate::runtime::{
    config::Scheduling, ids::ConnectionId, net::sender::ReceivedMessage,
};

/// What a logical thread finds in its queue.
pub(crate) enum Inbound {
    Message(ReceivedMessage),
    Disconnected(ConnectionId),
}

/// Producer side of a logical thread's queue. Both variants keep the order in
/// which a single producer pushed.
///
/// The in-thread variant is only ever fed from the thread driving the
/// `LocalSet`, but it is still `Send`: the same `LogicalThread` type runs under
/// both schedulings, and the concurrent one moves it between workers. It uses
/// the `futures` channel, which takes no part in tokio's task budget and so
/// never forces a yield in the middle of a busy `LocalSet`.
#[derive(Clone)]
pub(crate) enum InboxSender {
    InThread(local::UnboundedSender<Inbound>),
    Concurrent(mpsc::UnboundedSender<Inbound>),
}

pub(crate) enum InboxReceiver {
    InThread(local::UnboundedReceiver<Inbound>),
    Concurrent(mpsc::UnboundedReceiver<Inbound>),
}

pub(crate) fn inbox(scheduling: Scheduling) -> (InboxSender, InboxReceiver) {
    match scheduling {
        Scheduling::InThread => {
            let (tx, rx) = local::unbounded();
            (InboxSender::InThread(tx), InboxReceiver::InThread(rx))
        }
        Scheduling::Concurrent => {
            let (tx, rx) = mpsc::unbounded_channel();
            (InboxSender::Concurrent(tx), InboxReceiver::Concurrent(rx))
        }
    }
}

impl InboxSender {
    /// Never blocks. Hands the item back if the receiving side is gone.
    pub fn push(&self, item: Inbound) -> Result<(), Inbound> {
        match self {
            InboxSender::InThread(tx) => {
                tx.unbounded_send(item).map_err(|e| e.into_inner())
            }
            InboxSender::Concurrent(tx) => tx.send(item).map_err(|e| e.0),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            InboxSender::InThread(tx) => tx.is_closed(),
            InboxSender::Concurrent(tx) => tx.is_closed(),
        }
    }
}

impl InboxReceiver {
    pub async fn recv(&mut self) -> Option<Inbound> {
        match self {
            InboxReceiver::InThread(rx) => rx.next().await,
            InboxReceiver::Concurrent(rx) => rx.recv().await,
        }
    }

    /// Takes whatever is queued right now without waiting.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        match self {
            InboxReceiver::InThread(rx) => rx.next().now_or_never().flatten(),
            InboxReceiver::Concurrent(rx) => rx.try_recv().ok(),
        }
    }
}
