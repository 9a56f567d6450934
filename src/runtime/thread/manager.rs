use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    handler::{LogicalThreadFactory, RequestHandler},
    logical_thread::{LogicalThread, LogicalThreadHandle},
};
use crate::runtime::{
    config::{Config, Scheduling},
    context::RuntimeContext,
    ids::{ConnectionId, LogicalThreadId},
    net::{error::Error, sender::ReceivedMessage},
};

/// Routes inbound messages to the logical thread they belong to, joining
/// conversations started elsewhere on first contact.
///
/// The registry only ever holds logical threads that are still running. A
/// logical thread removes itself before it stops reading its queue, so a
/// message routed to a registered handle is never lost.
pub struct LogicalThreadManager {
    config: Config,
    factory: Box<dyn LogicalThreadFactory>,
    context: RuntimeContext,
    threads: RwLock<HashMap<LogicalThreadId, LogicalThreadHandle>>,
    retired: AtomicUsize,
}

impl LogicalThreadManager {
    pub fn new(
        config: Config,
        factory: impl LogicalThreadFactory,
        context: RuntimeContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory: Box::new(factory),
            context,
            threads: RwLock::new(HashMap::new()),
            retired: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn process_name(&self) -> &str {
        &self.config.process_name
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    /// Spawns onto the runtime the way the configured scheduling asks for.
    /// In-thread scheduling must be driven from inside a `LocalSet`.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.config.scheduling {
            Scheduling::InThread => tokio::task::spawn_local(future),
            Scheduling::Concurrent => tokio::spawn(future),
        }
    }

    pub fn create_logical_thread_id(&self) -> LogicalThreadId {
        LogicalThreadId::new()
    }

    /// Hands an inbound message to its logical thread, creating one if the
    /// conversation is new here. Never waits on the logical thread itself.
    pub fn dispatch(self: &Arc<Self>, msg: ReceivedMessage) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let id = msg.envelope.thread_id;
            {
                let threads = this.threads.read().await;
                if let Some(thread) = threads.get(&id).filter(|t| !t.is_finished()) {
                    if let Err(e) = thread.receive(msg) {
                        warn!(thread = %id, "dropping message: {e}");
                    }
                    return;
                }
            }

            let mut threads = this.threads.write().await;
            // someone may have joined it while we waited for the write lock
            if let Some(thread) = threads.get(&id).filter(|t| !t.is_finished()) {
                if let Err(e) = thread.receive(msg) {
                    warn!(thread = %id, "dropping message: {e}");
                }
                return;
            }
            if !msg.envelope.is_request() {
                debug!(
                    thread = %id,
                    kind = msg.envelope.body.kind(),
                    "no logical thread waiting for this, dropping"
                );
                return;
            }
            let Some(handler) = this.factory.join(&msg.envelope) else {
                drop(threads);
                debug!(thread = %id, "refusing conversation");
                if let Err(e) = msg
                    .sender
                    .send_error_response(&msg.envelope, "conversation refused")
                    .await
                {
                    warn!(thread = %id, "could not refuse: {e}");
                }
                return;
            };
            let origin = msg.sender.connection_id().clone();
            let (thread, handle) =
                LogicalThread::new(this.clone(), id, Some(origin), handler);
            if let Err(e) = handle.receive(msg) {
                warn!(thread = %id, "dropping message: {e}");
                return;
            }
            threads.insert(id, handle);
            drop(threads);
            debug!(thread = %id, "joined conversation");
            this.spawn(thread.run());
        }
        .boxed()
    }

    /// Starts a conversation here. `body` runs as the logical thread's
    /// outermost request, and the logical thread retires when it returns.
    pub async fn initiate<T, F>(
        self: &Arc<Self>,
        handler: Arc<dyn RequestHandler>,
        body: F,
    ) -> (LogicalThreadId, JoinHandle<Result<T, Error>>)
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut LogicalThread) -> BoxFuture<'a, Result<T, Error>>
            + Send
            + 'static,
    {
        let id = self.create_logical_thread_id();
        let (mut thread, handle) = LogicalThread::new(self.clone(), id, None, handler);
        self.threads.write().await.insert(id, handle);
        debug!(thread = %id, "initiated conversation");
        let join = self.spawn(
            async move {
                let connection = thread.self_connection_id();
                thread.request_started(connection);
                let result = body(&mut thread).await;
                thread.request_completed();
                thread.finish().await;
                result
            }
            .instrument(debug_span!("logical_thread", id = %id)),
        );
        (id, join)
    }

    /// Drops a logical thread from the registry. Returns whether it was there.
    pub async fn logical_thread_completed(&self, id: LogicalThreadId) -> bool {
        let mut threads = self.threads.write().await;
        let removed = threads.remove(&id).is_some();
        if removed {
            // counted before anyone can see the registry without it
            self.retired.fetch_add(1, Ordering::Relaxed);
        }
        drop(threads);
        trace!(thread = %id, removed, "logical thread completed");
        removed
    }

    /// How many logical threads have left the registry so far.
    pub fn retired_logical_threads(&self) -> usize {
        self.retired.load(Ordering::Relaxed)
    }

    /// Tells every running logical thread that `connection` is gone.
    pub async fn on_disconnect(&self, connection: &ConnectionId) {
        let threads: Vec<_> = self.threads.read().await.values().cloned().collect();
        debug!(%connection, threads = threads.len(), "connection lost");
        for thread in threads {
            thread.on_disconnect(connection.clone());
        }
    }

    pub async fn find_existing_logical_thread(
        &self,
        id: LogicalThreadId,
    ) -> Option<LogicalThreadHandle> {
        self.threads.read().await.get(&id).cloned()
    }

    /// Ids of every logical thread currently running, in order.
    pub async fn report_logical_threads(&self) -> Vec<LogicalThreadId> {
        let mut ids: Vec<_> = self.threads.read().await.keys().copied().collect();
        ids.sort();
        ids
    }
}
