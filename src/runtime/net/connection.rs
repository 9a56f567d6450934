use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{net::TcpStream, sync::Notify};
use tracing::debug;

use super::{
    error::Error,
    receiver::{DisconnectCallback, SocketReceiver},
    sender::{SenderRef, SocketSender},
};
use crate::runtime::{ids::ConnectionId, thread::LogicalThreadManager};

/// A live socket to another process: a sender plus a receive loop running in
/// its own task.
///
/// Can be shared; [`Connection::stop`] may be called any number of times.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    sender: Arc<SocketSender>,
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
}

impl Connection {
    /// Takes over `stream` and starts receiving. `on_disconnect` runs once the
    /// receive loop ends.
    pub fn start(
        stream: TcpStream,
        manager: &Arc<LogicalThreadManager>,
        on_disconnect: DisconnectCallback,
    ) -> Result<Self, Error> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let id = ConnectionId::socket(peer);
        let (reader, writer) = stream.into_split();
        let sender = Arc::new(SocketSender::new(id.clone(), writer));
        let shutdown = Arc::new(Notify::new());
        let receiver = SocketReceiver::new(
            reader,
            sender.clone(),
            manager.clone(),
            shutdown.clone(),
            on_disconnect,
        );
        manager.spawn(receiver.run());
        debug!(connection = %id, %peer, "connection started");
        Ok(Self {
            id,
            peer,
            sender,
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> SenderRef {
        self.sender.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ends the receive loop and closes the write side.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = %self.id, "stopping");
        self.shutdown.notify_one();
        self.sender.shutdown().await;
    }
}
