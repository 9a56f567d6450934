use std::sync::Arc;

use async_trait::async_trait;

use super::logical_thread::LogicalThread;
use crate::runtime::net::{
    error::Error,
    sender::SenderRef,
    wire::{Envelope, Message},
};

/// The requests a logical thread is able to service.
///
/// A handler runs inside the logical thread that received the request and may
/// issue requests of its own through `thread`, including back to `caller`.
/// Returning an error sends an error response; the logical thread carries on
/// either way.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        caller: SenderRef,
        request: Message,
    ) -> Result<Message, Error>;
}

/// Picks the handler for a conversation some other process started, based on
/// its first request. `None` refuses the conversation.
pub trait LogicalThreadFactory: Send + Sync + 'static {
    fn join(&self, envelope: &Envelope) -> Option<Arc<dyn RequestHandler>>;
}

impl<F> LogicalThreadFactory for F
where
    F: Fn(&Envelope) -> Option<Arc<dyn RequestHandler>> + Send + Sync + 'static,
{
    fn join(&self, envelope: &Envelope) -> Option<Arc<dyn RequestHandler>> {
        self(envelope)
    }
}

/// Joins every conversation with the same handler.
pub struct SharedHandler(pub Arc<dyn RequestHandler>);

impl LogicalThreadFactory for SharedHandler {
    fn join(&self, _: &Envelope) -> Option<Arc<dyn RequestHandler>> {
        Some(self.0.clone())
    }
}

/// Refuses every request, for logical threads that only make requests.
pub struct NoRequests;

#[async_trait]
impl RequestHandler for NoRequests {
    async fn handle(
        &self,
        _: &mut LogicalThread,
        _: SenderRef,
        request: Message,
    ) -> Result<Message, Error> {
        Err(Error::UnsupportedRequest(request.name()))
    }
}
