use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{
    receiver::ChannelReceiver,
    sender::{ChannelSender, SenderRef},
};
use crate::runtime::{ids::ConnectionId, thread::LogicalThreadManager};

/// Two managers in the same process wired together without a socket. Both
/// ends share one connection id.
pub struct ChannelLink {
    id: ConnectionId,
    forward: SenderRef,
    backward: SenderRef,
    shutdown: [Arc<Notify>; 2],
}

/// Connects `a` to `b`. Envelopes sent through [`ChannelLink::forward`] are
/// delivered to `b`, and those through [`ChannelLink::backward`] to `a`.
pub fn link(a: &Arc<LogicalThreadManager>, b: &Arc<LogicalThreadManager>) -> ChannelLink {
    let id = ConnectionId::channel();
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();
    let forward: SenderRef = Arc::new(ChannelSender::new(id.clone(), to_b));
    let backward: SenderRef = Arc::new(ChannelSender::new(id.clone(), to_a));
    let shutdown = [Arc::new(Notify::new()), Arc::new(Notify::new())];

    // b receives what a sends, and answers through `backward`
    for (manager, rx, reply, stop) in [
        (b, from_a, backward.clone(), shutdown[0].clone()),
        (a, from_b, forward.clone(), shutdown[1].clone()),
    ] {
        let notify = manager.clone();
        let on_disconnect = Box::new(move |id: ConnectionId| {
            async move { notify.on_disconnect(&id).await }.boxed()
        });
        let receiver = ChannelReceiver::new(rx, reply, manager.clone(), stop, on_disconnect);
        manager.spawn(receiver.run());
    }
    debug!(connection = %id, "linked");
    ChannelLink {
        id,
        forward,
        backward,
        shutdown,
    }
}

impl ChannelLink {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Reaches the second manager.
    pub fn forward(&self) -> SenderRef {
        self.forward.clone()
    }

    /// Reaches the first manager.
    pub fn backward(&self) -> SenderRef {
        self.backward.clone()
    }

    /// Stops both receive loops. Each side sees the link as disconnected.
    pub fn close(&self) {
        debug!(connection = %self.id, "closing link");
        for stop in &self.shutdown {
            stop.notify_one();
        }
    }
}
