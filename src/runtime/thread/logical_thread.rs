use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use tokio::time::{self, Instant};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    handler::RequestHandler,
    inbox::{inbox, Inbound, InboxReceiver, InboxSender},
    manager::LogicalThreadManager,
};
use crate::runtime::{
    context::RuntimeContext,
    ids::{ConnectionId, LogicalThreadId, RequestId},
    net::{
        error::Error,
        sender::{ReceivedMessage, Sender, SenderRef},
        wire::{Body, Envelope, Message},
    },
};

/// A cheap reference to a running logical thread, held by the manager's
/// registry to feed its queue.
#[derive(Clone)]
pub struct LogicalThreadHandle {
    id: LogicalThreadId,
    inbox: InboxSender,
}

impl LogicalThreadHandle {
    pub fn id(&self) -> LogicalThreadId {
        self.id
    }

    /// Queues an inbound message without waiting. Fails only once the
    /// logical thread has finished.
    pub fn receive(&self, msg: ReceivedMessage) -> Result<(), Error> {
        self.inbox
            .push(Inbound::Message(msg))
            .map_err(|_| Error::QueueClosed)
    }

    /// Queues a disconnect notice, handled in order with the messages.
    pub fn on_disconnect(&self, connection: ConnectionId) {
        if self.inbox.push(Inbound::Disconnected(connection)).is_err() {
            trace!(thread = %self.id, "disconnect for a finished logical thread");
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inbox.is_closed()
    }
}

/// Delivers envelopes straight into a logical thread's own queue.
#[derive(Clone)]
struct Loopback {
    id: ConnectionId,
    inbox: InboxSender,
}

#[async_trait]
impl Sender for Loopback {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    async fn send(&self, envelope: Envelope) -> Result<(), Error> {
        let sender: SenderRef = Arc::new(self.clone());
        self.inbox
            .push(Inbound::Message(ReceivedMessage { envelope, sender }))
            .map_err(|_| Error::QueueClosed)
    }
}

/// One conversation as seen from this process.
///
/// A logical thread owns its queue and runs on a single task. While it waits
/// for a response it keeps servicing the requests that arrive for it, so a
/// callee can call back into its caller without deadlocking. The call stack
/// holds the connection of every request in flight, inbound and outbound,
/// innermost last.
///
/// Responses are matched to the outbound request they answer by request id.
/// One that answers an outer request while an inner one is still pending is
/// parked until its request is innermost again.
pub struct LogicalThread {
    id: LogicalThreadId,
    manager: Arc<LogicalThreadManager>,
    handler: Arc<dyn RequestHandler>,
    origin: Option<ConnectionId>,
    stack: Vec<ConnectionId>,
    /// outbound requests waiting for a response, innermost last
    awaiting: Vec<(RequestId, ConnectionId)>,
    /// Replies that arrived for a request that isn't innermost yet, and the
    /// errors raised locally for a pending request, like a disconnect or a
    /// timeout.
    parked: HashMap<RequestId, Result<Message, String>>,
    disconnections: HashSet<ConnectionId>,
    self_connection: Option<ConnectionId>,
    inbox: InboxReceiver,
    loopback: InboxSender,
    request_timeout: Option<Duration>,
}

impl LogicalThread {
    pub(crate) fn new(
        manager: Arc<LogicalThreadManager>,
        id: LogicalThreadId,
        origin: Option<ConnectionId>,
        handler: Arc<dyn RequestHandler>,
    ) -> (Self, LogicalThreadHandle) {
        let (tx, rx) = inbox(manager.config().scheduling);
        let request_timeout = manager.config().request_timeout;
        let handle = LogicalThreadHandle {
            id,
            inbox: tx.clone(),
        };
        let thread = Self {
            id,
            manager,
            handler,
            origin,
            stack: Vec::new(),
            awaiting: Vec::new(),
            parked: HashMap::new(),
            disconnections: HashSet::new(),
            self_connection: None,
            inbox: rx,
            loopback: tx,
            request_timeout,
        };
        (thread, handle)
    }

    pub fn id(&self) -> LogicalThreadId {
        self.id
    }

    /// The connection that started this conversation, or `None` if it was
    /// initiated here.
    pub fn origin(&self) -> Option<&ConnectionId> {
        self.origin.as_ref()
    }

    pub fn manager(&self) -> &Arc<LogicalThreadManager> {
        &self.manager
    }

    pub fn context(&self) -> &RuntimeContext {
        self.manager.context()
    }

    /// Number of requests in flight, outbound and inbound.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn call_stack(&self) -> &[ConnectionId] {
        &self.stack
    }

    pub fn is_disconnected(&self, connection: &ConnectionId) -> bool {
        self.disconnections.contains(connection)
    }

    /// Id used for requests this logical thread makes to itself.
    pub fn self_connection_id(&mut self) -> ConnectionId {
        let id = self.id;
        self.self_connection
            .get_or_insert_with(|| ConnectionId::loopback(id))
            .clone()
    }

    /// A sender that delivers into this logical thread's own queue.
    pub fn loopback(&mut self) -> SenderRef {
        Arc::new(Loopback {
            id: self.self_connection_id(),
            inbox: self.loopback.clone(),
        })
    }

    pub fn request_started(&mut self, connection: ConnectionId) {
        trace!(thread = %self.id, depth = self.stack.len() + 1, %connection, "request started");
        self.stack.push(connection);
    }

    pub fn request_completed(&mut self) {
        match self.stack.pop() {
            Some(connection) => {
                trace!(thread = %self.id, depth = self.stack.len(), %connection, "request completed")
            }
            None => warn!(thread = %self.id, "request completed with nothing in flight"),
        }
    }

    /// Records that `connection` went away. Every outbound request waiting on
    /// it fails: the innermost one straight away, outer ones as soon as the
    /// requests nested inside them have unwound.
    pub fn on_disconnect(&mut self, connection: ConnectionId) {
        if !self.stack.contains(&connection)
            || self.disconnections.contains(&connection)
        {
            return;
        }
        let reason = format!("disconnected from {connection}");
        let lost: Vec<_> = self
            .awaiting
            .iter()
            .filter(|(_, waiting_on)| *waiting_on == connection)
            .map(|(request, _)| *request)
            .collect();
        debug!(thread = %self.id, %connection, requests = lost.len(), "disconnected mid request");
        for request in lost {
            self.park(request, Err(reason.clone()));
        }
        self.disconnections.insert(connection);
    }

    /// Sends `message` as a request over `sender` and waits for the response,
    /// servicing any requests that arrive meanwhile. Uses the configured
    /// request timeout, if any.
    pub async fn request(
        &mut self,
        sender: &SenderRef,
        message: Message,
    ) -> Result<Message, Error> {
        let timeout = self.request_timeout;
        self.request_within(sender, message, timeout).await
    }

    pub async fn request_with_timeout(
        &mut self,
        sender: &SenderRef,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, Error> {
        self.request_within(sender, message, Some(timeout)).await
    }

    async fn request_within(
        &mut self,
        sender: &SenderRef,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        let connection = sender.connection_id().clone();
        if self.disconnections.contains(&connection) {
            return Err(Error::Disconnected(connection));
        }
        let op = message.name();
        let request = RequestId::next();
        self.request_started(connection.clone());
        self.awaiting.push((request, connection));
        let result = match sender.send(Envelope::request(self.id, request, message)).await {
            Ok(()) => self.dispatch_requests_until_response_within(timeout).await,
            Err(e) => Err(e),
        };
        self.awaiting.pop();
        self.parked.remove(&request);
        self.request_completed();
        trace!(thread = %self.id, op, %request, ok = result.is_ok(), "request returned");
        result
    }

    /// Waits for the response to the innermost outbound request, dispatching
    /// inbound requests in arrival order until it shows up.
    pub async fn dispatch_requests_until_response(
        &mut self,
    ) -> Result<Message, Error> {
        let timeout = self.request_timeout;
        self.dispatch_requests_until_response_within(timeout).await
    }

    async fn dispatch_requests_until_response_within(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Message, Error> {
        let Some(&(request, _)) = self.awaiting.last() else {
            return Err(Error::NoPendingRequest);
        };
        let mut deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(reply) = self.parked.remove(&request) {
                return reply.map_err(Error::Remote);
            }
            let inbound = match deadline {
                Some(at) => match time::timeout_at(at, self.inbox.recv()).await {
                    Ok(inbound) => inbound,
                    Err(_) => {
                        deadline = None;
                        let waited = timeout.unwrap_or_default();
                        debug!(thread = %self.id, %request, ?waited, "request timed out");
                        self.park(request, Err(Error::TimedOut(waited).to_string()));
                        continue;
                    }
                },
                None => self.inbox.recv().await,
            };
            let Some(inbound) = inbound else {
                return Err(Error::QueueClosed);
            };
            self.process(inbound).await;
        }
    }

    /// Runs the handler for one inbound request and sends back its result,
    /// unless the requester has gone away in the meantime.
    async fn dispatch_request(
        &mut self,
        caller: SenderRef,
        request_id: RequestId,
        request: Message,
    ) {
        let connection = caller.connection_id().clone();
        let op = request.name();
        let started = Instant::now();
        self.request_started(connection.clone());
        let handler = self.handler.clone();
        let reply = match handler.handle(self, caller.clone(), request).await {
            Ok(response) => Envelope::response(self.id, request_id, response),
            Err(e) => {
                warn!(thread = %self.id, op, from = %connection, "request failed: {e}");
                Envelope::error(self.id, request_id, e.to_string())
            }
        };
        if self.disconnections.contains(&connection) {
            debug!(thread = %self.id, op, to = %connection, "requester is gone, dropping reply");
        } else if let Err(e) = caller.send(reply).await {
            warn!(thread = %self.id, op, to = %connection, "could not reply: {e}");
        }
        debug!(thread = %self.id, op, elapsed = ?started.elapsed(), "handled");
        self.request_completed();
    }

    /// Holds a reply for `request` until it is the innermost one. The first
    /// reply wins.
    fn park(&mut self, request: RequestId, reply: Result<Message, String>) {
        self.parked.entry(request).or_insert(reply);
    }

    /// Parks a reply for whichever pending request it answers.
    fn deliver(
        &mut self,
        request: RequestId,
        reply: Result<Message, String>,
        from: &ConnectionId,
    ) {
        if self.awaiting.iter().any(|(pending, _)| *pending == request) {
            self.park(request, reply);
        } else {
            debug!(thread = %self.id, %request, %from, "dropping reply nobody is waiting for");
        }
    }

    pub(crate) async fn next_inbound(&mut self) -> Option<Inbound> {
        self.inbox.recv().await
    }

    /// Handles one item from the queue.
    pub(crate) async fn process(&mut self, inbound: Inbound) {
        let msg = match inbound {
            Inbound::Disconnected(connection) => {
                return self.on_disconnect(connection);
            }
            Inbound::Message(msg) => msg,
        };
        let ReceivedMessage { envelope, sender } = msg;
        match envelope.body {
            Body::Request(request) => {
                self.dispatch_request(sender, envelope.request_id, request)
                    .await
            }
            Body::Response(response) => {
                self.deliver(envelope.request_id, Ok(response), sender.connection_id())
            }
            Body::Error(reason) => {
                self.deliver(envelope.request_id, Err(reason), sender.connection_id())
            }
        }
    }

    /// Services a conversation joined from elsewhere until nothing is left in
    /// flight, then retires it.
    pub(crate) async fn run(mut self) {
        let span = debug_span!("logical_thread", id = %self.id);
        async move {
            trace!("joined");
            while let Some(inbound) = self.next_inbound().await {
                self.process(inbound).await;
                if self.stack.is_empty() {
                    break;
                }
            }
            self.finish().await;
        }
        .instrument(span)
        .await
    }

    /// Leaves the registry, then hands anything that raced in behind the last
    /// request back to the manager, which starts a fresh logical thread for it.
    pub(crate) async fn finish(&mut self) {
        if !self.manager.logical_thread_completed(self.id).await {
            warn!(thread = %self.id, "finished while not registered");
        }
        while let Some(inbound) = self.inbox.try_recv() {
            if let Inbound::Message(msg) = inbound {
                trace!(thread = %self.id, "re-dispatching late arrival");
                self.manager.dispatch(msg).await;
            }
        }
        trace!(thread = %self.id, "finished");
    }
}
