//! Session operating-mode switches over the wire: handler gating, the
//! simulation round trip and bot-side mutations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use arbor_broker::{auth, BrokerShared, Server};
use arbor_core::{EntityKind, EntityRef, Side, SupervisedKind, Transaction, User};
use arbor_protocol::{
    AuthRequest, ControlCommand, ControlRequest, EntityPayload, FrameCodec, LoginRequest, Message,
    RegisterHandlerResponse, RegisterRequest,
};
use arbor_store::MemoryStore;

const USER_SECRET: [u8; 32] = [2; 32];
const SESSION_PID: u32 = 5001;

struct Client {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec),
        }
    }

    async fn send(&mut self, message: &Message, request_id: u32) {
        self.framed
            .send(message.encode(request_id))
            .await
            .expect("send");
    }

    async fn recv(&mut self) -> (u32, Message) {
        let frame = timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("receive timed out")
            .expect("connection closed")
            .expect("frame error");
        let request_id = frame.request_id;
        let message = Message::decode(&frame).expect("decodable frame");
        (request_id, message)
    }

    async fn authenticate(&mut self, user: &str) {
        self.send(
            &Message::Login(LoginRequest {
                user_name: user.into(),
            }),
            1,
        )
        .await;
        let (_, message) = self.recv().await;
        let Message::LoginResponse(login) = message else {
            panic!("expected login response, got {message:?}");
        };
        self.send(
            &Message::Auth(AuthRequest {
                signature: auth::sign(&login.challenge, &USER_SECRET),
            }),
            2,
        )
        .await;
        let (_, message) = self.recv().await;
        assert!(matches!(message, Message::AuthResponse));
    }

    async fn drain_snapshot(&mut self, frames: usize) {
        for _ in 0..frames {
            let (request_id, message) = self.recv().await;
            assert_eq!(request_id, 0);
            assert!(matches!(message, Message::UpdateEntity(_)));
        }
    }

    async fn recv_session_update(&mut self) -> arbor_protocol::SessionInfo {
        loop {
            let (_, message) = self.recv().await;
            if let Message::UpdateEntity(EntityPayload::Session(info)) = message {
                return info;
            }
        }
    }
}

async fn start_broker_with_session() -> (Arc<BrokerShared>, SocketAddr) {
    let store = MemoryStore::new();
    let shared = BrokerShared::connect(Arc::new(store), Duration::from_secs(5))
        .await
        .expect("broker connect");
    shared.seed_catalog(
        [("flip".to_string(), "bots/flip".to_string())],
        [(
            "paper".to_string(),
            "markets/paper".to_string(),
            "USD".to_string(),
            "BTC".to_string(),
        )],
    );
    shared
        .provision_user(User::new("kay", [1; 32], USER_SECRET))
        .await
        .expect("provision");
    shared.with_directory(|directory| {
        directory
            .create_market("kay", 1, "trader", "key", "secret")
            .expect("create market");
        directory
            .create_session("kay", "flip-1", 1, 1, Decimal::new(100, 0), Decimal::ZERO)
            .expect("create session");
    });
    shared
        .apply_process_pid("kay", SupervisedKind::Session, 1, Some(SESSION_PID))
        .await;

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&shared))
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());
    (shared, addr)
}

fn control(command: ControlCommand) -> Message {
    Message::ControlEntity(ControlRequest {
        entity: EntityRef::new(EntityKind::Session, 1),
        command,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn mode_switch_requires_detached_handler() {
    let (_shared, addr) = start_broker_with_session().await;

    let mut bot = Client::connect(addr).await;
    bot.send(
        &Message::RegisterHandler(RegisterRequest {
            kind: SupervisedKind::Session,
            pid: SESSION_PID,
        }),
        1,
    )
    .await;
    let (_, message) = bot.recv().await;
    let Message::RegisterHandlerResponse(RegisterHandlerResponse::Bot {
        market_adapter,
        currency_base,
        simulation,
        ..
    }) = message
    else {
        panic!("expected bot handler response, got {message:?}");
    };
    assert_eq!(market_adapter, "paper");
    assert_eq!(currency_base, "USD");
    assert!(!simulation);

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(4).await; // engine, adapter, market, session

    // Attached handler blocks the switch.
    user.send(&control(ControlCommand::StartSimulation), 10).await;
    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 10);
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(
        err.message,
        "Cannot switch mode while a handler is attached."
    );

    // Dropping the handler frees the session; the broker broadcasts the
    // demoted entity before accepting the switch.
    drop(bot);
    let _demoted = user.recv_session_update().await;

    user.send(&control(ControlCommand::StartSimulation), 11).await;
    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 11);
    assert!(matches!(message, Message::ControlEntityResponse(_)));
    let info = user.recv_session_update().await;
    assert!(info.simulation);
}

#[tokio::test(flavor = "multi_thread")]
async fn simulation_round_trip_restores_live_collections() {
    let (shared, addr) = start_broker_with_session().await;

    // A bot viewer records one live transaction.
    let mut bot = Client::connect(addr).await;
    bot.send(
        &Message::RegisterViewer(RegisterRequest {
            kind: SupervisedKind::Session,
            pid: SESSION_PID,
        }),
        1,
    )
    .await;
    let (_, message) = bot.recv().await;
    assert!(matches!(message, Message::RegisterViewerResponse(_)));

    bot.send(
        &Message::CreateEntity(EntityPayload::SessionTransaction(Transaction {
            id: 0,
            side: Side::Buy,
            price: Decimal::new(300, 0),
            amount: Decimal::new(2, 2),
            fee: Decimal::ZERO,
            created_at: Utc::now(),
        })),
        2,
    )
    .await;
    let (_, message) = bot.recv().await;
    let Message::CreateEntityResponse(EntityPayload::SessionTransaction(tx)) = message else {
        panic!("expected transaction response, got {message:?}");
    };
    assert_eq!(tx.id, 1);
    drop(bot);

    let live_before = shared.with_directory(|directory| {
        directory.session("kay", 1).unwrap().ledger().clone()
    });
    assert_eq!(live_before.transactions.len(), 1);

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(4).await;

    user.send(&control(ControlCommand::StartSimulation), 20).await;
    let (_, message) = user.recv().await;
    assert!(matches!(message, Message::ControlEntityResponse(_)));
    let info = user.recv_session_update().await;
    assert!(info.simulation);
    assert_eq!(info.balance.available_base, Decimal::new(100, 0));

    // The active ledger is now the fresh simulation one.
    shared.with_directory(|directory| {
        let session = directory.session("kay", 1).unwrap();
        assert!(session.ledger().transactions.is_empty());
    });

    user.send(&control(ControlCommand::StartLive), 21).await;
    let (_, message) = user.recv().await;
    assert!(matches!(message, Message::ControlEntityResponse(_)));
    let info = user.recv_session_update().await;
    assert!(!info.simulation);

    // Whatever the simulation did is gone; live history is intact.
    let live_after = shared.with_directory(|directory| {
        directory.session("kay", 1).unwrap().ledger().clone()
    });
    assert_eq!(live_after, live_before);
}
