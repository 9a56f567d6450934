use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use weave::runtime::{
    config::Config,
    context::RuntimeContext,
    daemon::DaemonHandler,
    net::{client::Client, server::Server, wire::Message, Error, DEFAULT_PORT},
    sim::{spawn_simulation, MoveId, Simulation},
    thread::{LogicalThreadManager, NoRequests, SharedHandler},
};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Distributed simulation runtime daemon", long_about = None)]
struct Cli {
    /// Name reported in status replies and logs
    #[arg(long, default_value = "weave")]
    name: String,

    /// Give up on a request after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and answer requests until interrupted
    Serve {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        listen: SocketAddr,
    },

    /// Check that a daemon is reachable
    Ping { addr: SocketAddr },

    /// List a daemon's running logical threads
    Status { addr: SocketAddr },
}

/// Steps nothing; keeps the lock protocol running for remote callers.
struct Idle;

impl Simulation for Idle {
    fn on_clock_tick(&mut self, tick: u64) -> Vec<MoveId> {
        info!(tick, "clock tick");
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::builder().process_name(cli.name).build();
    config.request_timeout = cli.timeout_ms.map(Duration::from_millis);

    match cli.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Ping { addr } => {
            let nonce = rand::random();
            match call(config, addr, Message::Ping { nonce }).await? {
                Message::Pong { nonce: echoed } if echoed == nonce => {
                    println!("{addr} is alive");
                    Ok(())
                }
                other => Err(Error::UnexpectedResponse(other.name()).into()),
            }
        }
        Command::Status { addr } => match call(config, addr, Message::Status).await? {
            Message::StatusReport { process, threads } => {
                println!("{process}: {} logical threads", threads.len());
                for id in threads {
                    println!("  {id}");
                }
                Ok(())
            }
            other => Err(Error::UnexpectedResponse(other.name()).into()),
        },
    }
}

async fn serve(config: Config, listen: SocketAddr) -> Result<()> {
    let handler = DaemonHandler::new();
    let manager = LogicalThreadManager::new(
        config,
        SharedHandler(handler.clone()),
        RuntimeContext::default(),
    );
    let (simulation, driver) = spawn_simulation(&manager, Idle).await;
    handler.attach_simulation(simulation);
    let server = Server::listen(listen, manager.clone()).await?;
    info!(addr = %server.local_addr(), "serving");

    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("interrupted, shutting down");
        }
        finished = driver => match finished? {
            Ok(()) => info!("simulation terminated"),
            Err(e) => error!("simulation stopped: {e}"),
        },
    }
    server.stop().await;
    Ok(())
}

/// Makes one request on a fresh logical thread and returns the reply.
async fn call(config: Config, addr: SocketAddr, message: Message) -> Result<Message> {
    let manager = LogicalThreadManager::new(
        config,
        SharedHandler(Arc::new(NoRequests)),
        RuntimeContext::default(),
    );
    let client = Client::connect(addr, manager.clone()).await?;
    let sender = client.sender();
    let (_, reply) = manager
        .initiate(Arc::new(NoRequests), move |thread| {
            async move { thread.request(&sender, message).await }.boxed()
        })
        .await;
    let reply = reply.await??;
    client.stop().await;
    Ok(reply)
}
