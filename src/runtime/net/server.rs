use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::FutureExt;
use hashbrown::HashMap;
use tokio::{
    net::{TcpListener, ToSocketAddrs},
    sync::RwLock,
    task::JoinHandle,
};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{connection::Connection, error::Error, sender::SenderRef};
use crate::runtime::{
    ids::{ConnectionId, MachineId, Mp, Mpo},
    thread::LogicalThreadManager,
};

/// Name a connection can be found by, at whichever granularity the peer is
/// known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionLabel {
    Machine(MachineId),
    Mp(Mp),
    Mpo(Mpo),
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before accepting again after `failures` failed accepts in a row.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

type Connections = Arc<RwLock<HashMap<ConnectionId, Arc<Connection>>>>;
type Labels = Arc<RwLock<HashMap<ConnectionLabel, ConnectionId>>>;

/// Accepts connections and keeps track of the live ones.
pub struct Server {
    local_addr: SocketAddr,
    connections: Connections,
    labels: Labels,
    acceptor: JoinHandle<()>,
}

impl Server {
    /// Binds `addr` and starts accepting in a dedicated task. Every accepted
    /// connection delivers into `manager`.
    pub async fn listen(
        addr: impl ToSocketAddrs,
        manager: Arc<LogicalThreadManager>,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let connections = Connections::default();
        let labels = Labels::default();
        let span = debug_span!("server", addr = %local_addr);
        let acceptor = manager.spawn(
            Self::start_acceptor(
                listener,
                manager.clone(),
                connections.clone(),
                labels.clone(),
            )
            .instrument(span),
        );
        info!(process = manager.process_name(), addr = %local_addr, "listening");
        Ok(Self {
            local_addr,
            connections,
            labels,
            acceptor,
        })
    }

    /// Accepts until the listener fails or the task is aborted.
    async fn start_acceptor(
        listener: TcpListener,
        manager: Arc<LogicalThreadManager>,
        connections: Connections,
        labels: Labels,
    ) {
        let mut failures = 0;
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => {
                    failures = 0;
                    stream
                }
                Err(e) => {
                    // running out of descriptors fails every accept until
                    // some connection goes away
                    let pause = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    warn!(?pause, "accept failed: {e}");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            let on_disconnect = {
                let manager = manager.clone();
                let connections = connections.clone();
                let labels = labels.clone();
                Box::new(move |id: ConnectionId| {
                    async move {
                        connections.write().await.remove(&id);
                        labels.write().await.retain(|_, labelled| *labelled != id);
                        debug!(connection = %id, "disconnected");
                        manager.on_disconnect(&id).await;
                    }
                    .boxed()
                })
            };
            // registered before the receiver could possibly report it gone
            let mut live = connections.write().await;
            match Connection::start(stream, &manager, on_disconnect) {
                Ok(connection) => {
                    debug!(connection = %connection.id(), peer = %connection.peer(), "accepted");
                    live.insert(connection.id().clone(), Arc::new(connection));
                }
                Err(e) => warn!("could not start connection: {e}"),
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every live connection.
    pub async fn stop(&self) {
        self.acceptor.abort();
        let live: Vec<_> = self.connections.read().await.values().cloned().collect();
        debug!(connections = live.len(), "stopping server");
        for connection in live {
            connection.stop().await;
        }
    }

    pub async fn label_connection(&self, id: &ConnectionId, label: ConnectionLabel) -> Result<(), Error> {
        if !self.connections.read().await.contains_key(id) {
            return Err(Error::Disconnected(id.clone()));
        }
        self.labels.write().await.insert(label, id.clone());
        Ok(())
    }

    pub async fn unlabel_connection(&self, label: &ConnectionLabel) -> Option<ConnectionId> {
        self.labels.write().await.remove(label)
    }

    pub async fn find_connection(&self, label: &ConnectionLabel) -> Option<ConnectionId> {
        self.labels.read().await.get(label).cloned()
    }

    /// The sender for a live connection.
    pub async fn sender(&self, id: &ConnectionId) -> Option<SenderRef> {
        self.connections.read().await.get(id).map(|c| c.sender())
    }

    pub async fn connections(&self) -> Vec<ConnectionId> {
        self.connections.read().await.keys().cloned().collect()
    }
}
