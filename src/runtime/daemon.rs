use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::debug;

use crate::runtime::{
    net::{error::Error, sender::SenderRef, wire::Message},
    sim::SimulationHandle,
    thread::{LogicalThread, RequestHandler},
};

/// The requests a daemon process answers for its peers.
#[derive(Default)]
pub struct DaemonHandler {
    simulation: OnceLock<SimulationHandle>,
}

impl DaemonHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Routes `Sim` requests to `simulation` from now on. Only the first call
    /// has any effect.
    pub fn attach_simulation(&self, simulation: SimulationHandle) -> bool {
        self.simulation.set(simulation).is_ok()
    }
}

#[async_trait]
impl RequestHandler for DaemonHandler {
    async fn handle(
        &self,
        thread: &mut LogicalThread,
        caller: SenderRef,
        request: Message,
    ) -> Result<Message, Error> {
        match request {
            Message::Ping { nonce } => Ok(Message::Pong { nonce }),
            Message::Status => Ok(Message::StatusReport {
                process: thread.manager().process_name().to_owned(),
                threads: thread.manager().report_logical_threads().await,
            }),
            Message::Sim(msg) => {
                let simulation = self
                    .simulation
                    .get()
                    .ok_or(Error::MissingCollaborator("simulation"))?;
                debug!(from = %caller.connection_id(), ?msg, "lock traffic");
                simulation.submit(msg.clone()).await?;
                Ok(Message::SimAck(msg))
            }
            Message::Invoke { invocation, args } => {
                let function = thread.context().resolve(&invocation)?;
                debug!(%invocation, "invoking");
                Ok(Message::Invoked {
                    result: function(args.as_slice()),
                })
            }
            other => Err(Error::UnsupportedRequest(other.name())),
        }
    }
}
