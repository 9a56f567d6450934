use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{mpsc, Mutex},
};
use tracing::trace;

use super::{
    error::Error,
    wire::{self, Envelope},
};
use crate::runtime::ids::ConnectionId;

/// The outbound half of a connection.
#[async_trait]
pub trait Sender: Send + Sync + 'static {
    fn connection_id(&self) -> &ConnectionId;

    /// Resolves once the envelope has been handed to the transport.
    async fn send(&self, envelope: Envelope) -> Result<(), Error>;

    /// Answers `original` with an error carrying `reason`.
    async fn send_error_response(
        &self,
        original: &Envelope,
        reason: &str,
    ) -> Result<(), Error> {
        self.send(Envelope::error(original.thread_id, original.request_id, reason))
            .await
    }
}

pub type SenderRef = Arc<dyn Sender>;

/// An inbound envelope along with the sender that reaches whoever sent it.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub sender: SenderRef,
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("envelope", &self.envelope)
            .field("from", self.sender.connection_id())
            .finish()
    }
}

/// Writes length prefixed frames to a socket. Concurrent sends are serialized
/// so frames never interleave.
pub struct SocketSender {
    id: ConnectionId,
    stream: Mutex<OwnedWriteHalf>,
}

impl SocketSender {
    pub fn new(id: ConnectionId, stream: OwnedWriteHalf) -> Self {
        Self {
            id,
            stream: Mutex::new(stream),
        }
    }

    /// Closes the write side, which the peer sees as end of stream.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stream.lock().await.shutdown().await {
            trace!(connection = %self.id, "shutdown: {e}");
        }
    }
}

#[async_trait]
impl Sender for SocketSender {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        let frame = wire::encode(&envelope)?;
        trace!(
            connection = %self.id,
            thread = %envelope.thread_id,
            request = %envelope.request_id,
            kind = envelope.body.kind(),
            len = frame.len(),
            "send"
        );
        self.stream.lock().await.write_all(&frame).await?;
        Ok(())
    }
}

/// Pushes envelopes into an in-process queue without serializing them.
pub struct ChannelSender {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSender {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, tx }
    }
}

#[async_trait]
impl Sender for ChannelSender {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.tx.send(envelope).map_err(|_| Error::ChannelClosed)
    }
}
