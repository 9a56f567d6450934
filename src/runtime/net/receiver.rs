use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::{
    io::BufReader,
    net::tcp::OwnedReadHalf,
    select,
    sync::{mpsc, Notify},
};
use tracing::{debug, debug_span, error, trace, Instrument};

use super::{
    sender::{ReceivedMessage, SenderRef},
    wire,
};
use crate::runtime::{ids::ConnectionId, thread::LogicalThreadManager};

/// Runs once when a receive loop ends, however it ended.
pub type DisconnectCallback =
    Box<dyn FnOnce(ConnectionId) -> BoxFuture<'static, ()> + Send>;

/// Reads frames off a socket and hands each envelope to the manager, paired
/// with the sender for the same connection.
pub struct SocketReceiver {
    reader: BufReader<OwnedReadHalf>,
    sender: SenderRef,
    manager: Arc<LogicalThreadManager>,
    shutdown: Arc<Notify>,
    on_disconnect: DisconnectCallback,
}

impl SocketReceiver {
    pub fn new(
        reader: OwnedReadHalf,
        sender: SenderRef,
        manager: Arc<LogicalThreadManager>,
        shutdown: Arc<Notify>,
        on_disconnect: DisconnectCallback,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            sender,
            manager,
            shutdown,
            on_disconnect,
        }
    }

    /// Receives until the peer closes, a frame fails to read, or shutdown is
    /// requested. Should be spawned in a dedicated task.
    pub async fn run(mut self) {
        let id = self.sender.connection_id().clone();
        let span = debug_span!("receiver", connection = %id);
        let max_len = self.manager.config().max_frame_len;
        async move {
            debug!("receiving");
            loop {
                let envelope = select! {
                    read = wire::read_frame(&mut self.reader, max_len) => match read {
                        Ok(envelope) => envelope,
                        Err(e) if e.is_expected_close() => {
                            trace!("closed by peer: {e}");
                            break;
                        }
                        Err(e) => {
                            error!("receive failed: {e}");
                            break;
                        }
                    },
                    _ = self.shutdown.notified() => {
                        trace!("shut down");
                        break;
                    }
                };
                trace!(
                    thread = %envelope.thread_id,
                    kind = envelope.body.kind(),
                    "received"
                );
                let sender = self.sender.clone();
                self.manager
                    .dispatch(ReceivedMessage { envelope, sender })
                    .await;
            }
            (self.on_disconnect)(id).await;
        }
        .instrument(span)
        .await
    }
}

/// The in-process counterpart of [`SocketReceiver`].
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<wire::Envelope>,
    sender: SenderRef,
    manager: Arc<LogicalThreadManager>,
    shutdown: Arc<Notify>,
    on_disconnect: DisconnectCallback,
}

impl ChannelReceiver {
    pub fn new(
        rx: mpsc::UnboundedReceiver<wire::Envelope>,
        sender: SenderRef,
        manager: Arc<LogicalThreadManager>,
        shutdown: Arc<Notify>,
        on_disconnect: DisconnectCallback,
    ) -> Self {
        Self {
            rx,
            sender,
            manager,
            shutdown,
            on_disconnect,
        }
    }

    pub async fn run(mut self) {
        let id = self.sender.connection_id().clone();
        let span = debug_span!("receiver", connection = %id);
        async move {
            loop {
                let envelope = select! {
                    received = self.rx.recv() => match received {
                        Some(envelope) => envelope,
                        None => {
                            trace!("channel closed");
                            break;
                        }
                    },
                    _ = self.shutdown.notified() => {
                        trace!("shut down");
                        break;
                    }
                };
                let sender = self.sender.clone();
                self.manager
                    .dispatch(ReceivedMessage { envelope, sender })
                    .await;
            }
            (self.on_disconnect)(id).await;
        }
        .instrument(span)
        .await
    }
}
