use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use weave::runtime::{
    config::Config,
    context::RuntimeContext,
    daemon::DaemonHandler,
    ids::{MachineId, Mpo},
    net::{
        client::Client,
        error::Error,
        sender::SenderRef,
        server::{ConnectionLabel, Server},
        wire::Message,
    },
    sim::{spawn_simulation, MoveId, SimMessage, Simulation},
    thread::{LogicalThreadManager, NoRequests, SharedHandler},
};

struct Idle;

impl Simulation for Idle {
    fn on_clock_tick(&mut self, _: u64) -> Vec<MoveId> {
        Vec::new()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

async fn daemon() -> (Arc<LogicalThreadManager>, Server) {
    init_tracing();
    let handler = DaemonHandler::new();
    let manager = LogicalThreadManager::new(
        Config::builder().process_name("daemon").build(),
        SharedHandler(handler.clone()),
        RuntimeContext::default(),
    );
    let (simulation, _) = spawn_simulation(&manager, Idle).await;
    assert!(handler.attach_simulation(simulation));
    let server = Server::listen("127.0.0.1:0", manager.clone()).await.unwrap();
    (manager, server)
}

async fn client(server: &Server) -> (Arc<LogicalThreadManager>, Client) {
    let manager = LogicalThreadManager::new(
        Config::builder().process_name("client").build(),
        SharedHandler(Arc::new(NoRequests)),
        RuntimeContext::default(),
    );
    let client = Client::connect(server.local_addr(), manager.clone())
        .await
        .unwrap();
    (manager, client)
}

async fn call(
    manager: &Arc<LogicalThreadManager>,
    to: SenderRef,
    messages: Vec<Message>,
) -> Result<Vec<Message>, Error> {
    let (_, done) = manager
        .initiate(Arc::new(NoRequests), move |thread| {
            async move {
                let mut replies = Vec::new();
                for message in messages {
                    replies.push(thread.request(&to, message).await?);
                }
                Ok(replies)
            }
            .boxed()
        })
        .await;
    done.await.unwrap()
}

#[tokio::test]
async fn ping_and_status_over_tcp() {
    let (_daemon, server) = daemon().await;
    let (manager, client) = client(&server).await;

    let replies = call(
        &manager,
        client.sender(),
        vec![Message::Ping { nonce: 42 }, Message::Status],
    )
    .await
    .unwrap();
    assert_eq!(replies[0], Message::Pong { nonce: 42 });
    match &replies[1] {
        Message::StatusReport { process, threads } => {
            assert_eq!(process, "daemon");
            // the simulation driver and the conversation asking
            assert_eq!(threads.len(), 2);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn lock_traffic_is_acknowledged() {
    let (_daemon, server) = daemon().await;
    let (manager, client) = client(&server).await;
    let a = Mpo::new(1, 0, 1);

    let replies = call(
        &manager,
        client.sender(),
        vec![
            Message::Sim(SimMessage::Read(a)),
            Message::Sim(SimMessage::Release(a)),
            Message::Sim(SimMessage::Clock { tick: 1 }),
        ],
    )
    .await
    .unwrap();
    assert_eq!(
        replies,
        vec![
            Message::SimAck(SimMessage::Read(a)),
            Message::SimAck(SimMessage::Release(a)),
            Message::SimAck(SimMessage::Clock { tick: 1 }),
        ]
    );

    let refused = call(&manager, client.sender(), vec![Message::Pong { nonce: 1 }])
        .await
        .unwrap_err();
    assert!(matches!(refused, Error::Remote(reason) if reason == "unsupported request pong"));
}

#[tokio::test]
async fn connections_can_be_labelled_and_stopped() {
    let (daemon, server) = daemon().await;
    let (manager, client) = client(&server).await;
    // make sure the daemon has registered the connection
    call(&manager, client.sender(), vec![Message::Ping { nonce: 0 }])
        .await
        .unwrap();

    let live = server.connections().await;
    assert_eq!(live.len(), 1);
    let label = ConnectionLabel::Machine(MachineId(9));
    server.label_connection(&live[0], label).await.unwrap();
    assert_eq!(server.find_connection(&label).await.as_ref(), Some(&live[0]));
    assert!(server.sender(&live[0]).await.is_some());

    client.stop().await;
    for _ in 0..200 {
        if server.connections().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(server.connections().await.is_empty());
    assert_eq!(server.find_connection(&label).await, None);
    assert!(matches!(
        server.label_connection(&live[0], label).await,
        Err(Error::Disconnected(_))
    ));
    // only the simulation driver is left
    assert_eq!(daemon.report_logical_threads().await.len(), 1);
    server.stop().await;
}
