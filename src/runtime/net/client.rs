use std::{net::SocketAddr, sync::Arc};

use futures::FutureExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use super::{connection::Connection, error::Error, sender::SenderRef};
use crate::runtime::{ids::ConnectionId, thread::LogicalThreadManager};

/// An outbound connection. Requests sent through [`Client::sender`] are
/// answered through the same connection, and the peer may make requests of
/// its own over it.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        manager: Arc<LogicalThreadManager>,
    ) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).await?;
        let on_disconnect = {
            let manager = manager.clone();
            Box::new(move |id: ConnectionId| {
                async move {
                    debug!(connection = %id, "disconnected");
                    manager.on_disconnect(&id).await;
                }
                .boxed()
            })
        };
        let connection = Connection::start(stream, &manager, on_disconnect)?;
        Ok(Self { connection })
    }

    pub fn sender(&self) -> SenderRef {
        self.connection.sender()
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.connection.peer()
    }

    pub async fn stop(&self) {
        self.connection.stop().await
    }
}
