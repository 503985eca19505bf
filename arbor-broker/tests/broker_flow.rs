//! End-to-end exercises of the broker over real sockets: authentication,
//! handler registration, proxied calls and disconnect handling.

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
use arbor_core::{
    EntityKind, EntityRef, Order, RunState, Side, SupervisedKind, User,
};
use arbor_protocol::{
    AuthRequest, ControlCommand, ControlRequest, EntityPayload, FrameCodec, LoginRequest,
    MarketInfo, Message, RegisterHandlerResponse, RegisterRequest,
};
use arbor_store::records::MarketRecord;
use arbor_store::{EntityStore, MemoryStore};

const USER_SECRET: [u8; 32] = [2; 32];

async fn start_broker() -> (Arc<BrokerShared>, SocketAddr, MemoryStore) {
    let store = MemoryStore::new();
    let shared = BrokerShared::connect(Arc::new(store.clone()), Duration::from_secs(5))
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
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&shared))
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());
    (shared, addr, store)
}

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

    async fn expect_silence(&mut self, wait: Duration) {
        assert!(
            timeout(wait, self.framed.next()).await.is_err(),
            "expected no further frames"
        );
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

    /// Swallow the post-auth directory snapshot.
    async fn drain_snapshot(&mut self, frames: usize) {
        for _ in 0..frames {
            let (request_id, message) = self.recv().await;
            assert_eq!(request_id, 0);
            assert!(matches!(message, Message::UpdateEntity(_)));
        }
    }
}

fn market_create_payload() -> EntityPayload {
    EntityPayload::Market(MarketInfo {
        id: 0,
        adapter_id: 1,
        venue_user_name: "trader".into(),
        api_key: "key".into(),
        api_secret: "secret".into(),
        run_state: RunState::Stopped,
    })
}

fn order_request() -> Order {
    Order {
        id: 0,
        side: Side::Buy,
        price: Decimal::new(300, 0),
        amount: Decimal::new(2, 2),
        fee: Decimal::ZERO,
        timeout: None,
        created_at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn login_auth_streams_catalog_and_create_market_persists() {
    let (_shared, addr, store) = start_broker().await;
    let mut client = Client::connect(addr).await;
    client.authenticate("kay").await;
    client.drain_snapshot(2).await; // one engine, one adapter

    client
        .send(&Message::CreateEntity(market_create_payload()), 7)
        .await;
    let (request_id, message) = client.recv().await;
    assert_eq!(request_id, 7);
    let Message::CreateEntityResponse(EntityPayload::Market(created)) = message else {
        panic!("expected market response, got {message:?}");
    };
    assert_eq!(created.id, 1);
    assert_eq!(created.run_state, RunState::Stopped);

    // The supervisor cooperation kicks in right away: the fresh market is
    // marked starting and broadcast to the owner's connections.
    let (_, message) = client.recv().await;
    let Message::UpdateEntity(EntityPayload::Market(updated)) = message else {
        panic!("expected market update, got {message:?}");
    };
    assert_eq!(updated.run_state, RunState::Starting);

    // Persisted through the store, carrying the adapter executable.
    let markets = store.create_table("markets").await.unwrap();
    let rows = store.query(markets).await.unwrap();
    assert_eq!(rows.len(), 1);
    let record: MarketRecord = serde_json::from_value(rows[0].1.clone()).unwrap();
    assert_eq!(record.user, "kay");
    assert_eq!(record.executable, "markets/paper");
    assert_eq!(record.market.id, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_signature_is_rejected() {
    let (_shared, addr, _store) = start_broker().await;
    let mut client = Client::connect(addr).await;
    client
        .send(
            &Message::Login(LoginRequest {
                user_name: "kay".into(),
            }),
            1,
        )
        .await;
    let (_, message) = client.recv().await;
    assert!(matches!(message, Message::LoginResponse(_)));

    client
        .send(
            &Message::Auth(AuthRequest {
                signature: [9; 32],
            }),
            2,
        )
        .await;
    let (request_id, message) = client.recv().await;
    assert_eq!(request_id, 2);
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(err.message, "Incorrect signature.");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_user_is_rejected() {
    let (_shared, addr, _store) = start_broker().await;
    let mut client = Client::connect(addr).await;
    client
        .send(
            &Message::Login(LoginRequest {
                user_name: "nobody".into(),
            }),
            3,
        )
        .await;
    let (request_id, message) = client.recv().await;
    assert_eq!(request_id, 3);
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(err.message, "Unknown user.");
}

#[tokio::test(flavor = "multi_thread")]
async fn second_handler_registration_fails_and_first_stays_bound() {
    let (shared, addr, _store) = start_broker().await;
    seed_market(&shared, 4711).await;

    let mut first = Client::connect(addr).await;
    first
        .send(
            &Message::RegisterHandler(RegisterRequest {
                kind: SupervisedKind::Market,
                pid: 4711,
            }),
            1,
        )
        .await;
    let (_, message) = first.recv().await;
    assert!(matches!(
        message,
        Message::RegisterHandlerResponse(RegisterHandlerResponse::Market { .. })
    ));
    // The fresh handler gets primed with a balance refresh.
    let (request_id, message) = first.recv().await;
    assert_eq!(request_id, 0);
    assert!(matches!(message, Message::ControlEntity(_)));

    let mut second = Client::connect(addr).await;
    second
        .send(
            &Message::RegisterHandler(RegisterRequest {
                kind: SupervisedKind::Market,
                pid: 4711,
            }),
            1,
        )
        .await;
    let (_, message) = second.recv().await;
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(err.message, "Invalid market.");

    // The first handler still answers proxied calls.
    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(3).await; // engine, adapter, market
    select_market(&mut user, 1).await;
    user.send(
        &Message::CreateEntity(EntityPayload::MarketOrder(order_request())),
        9,
    )
    .await;
    let (_, message) = first.recv().await;
    assert!(matches!(
        message,
        Message::CreateEntity(EntityPayload::MarketOrder(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn proxied_order_round_trips_and_notifies_viewers() {
    let (shared, addr, store) = start_broker().await;
    seed_market(&shared, 4711).await;

    let mut handler = Client::connect(addr).await;
    handler
        .send(
            &Message::RegisterHandler(RegisterRequest {
                kind: SupervisedKind::Market,
                pid: 4711,
            }),
            1,
        )
        .await;
    let (_, _register_response) = handler.recv().await;
    let (_, _refresh_push) = handler.recv().await;

    let mut viewer = Client::connect(addr).await;
    viewer.authenticate("kay").await;
    viewer.drain_snapshot(3).await;
    select_market(&mut viewer, 1).await;

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(3).await;
    select_market(&mut user, 1).await;

    user.send(
        &Message::CreateEntity(EntityPayload::MarketOrder(order_request())),
        21,
    )
    .await;

    // The handler sees the request under a correlation id, never the
    // caller's own request id.
    let (correlation_id, message) = handler.recv().await;
    assert_ne!(correlation_id, 0);
    assert_ne!(correlation_id, 21);
    let Message::CreateEntity(EntityPayload::MarketOrder(requested)) = message else {
        panic!("expected proxied order, got {message:?}");
    };
    assert_eq!(requested.price, Decimal::new(300, 0));

    let mut accepted = requested.clone();
    accepted.id = 42;
    handler
        .send(
            &Message::CreateEntityResponse(EntityPayload::MarketOrder(accepted)),
            correlation_id,
        )
        .await;

    // Caller gets the response under its original request id.
    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 21);
    let Message::CreateEntityResponse(EntityPayload::MarketOrder(order)) = message else {
        panic!("expected order response, got {message:?}");
    };
    assert_eq!(order.id, 42);

    // The other viewer is notified of the new order.
    let (_, message) = viewer.recv().await;
    let Message::UpdateEntity(EntityPayload::MarketOrder(order)) = message else {
        panic!("expected order update, got {message:?}");
    };
    assert_eq!(order.id, 42);

    // And the order reached the store.
    let markets = store.create_table("markets").await.unwrap();
    let mut persisted = false;
    for _ in 0..50 {
        let rows = store.query(markets).await.unwrap();
        if let Some((_, value)) = rows.first() {
            let record: MarketRecord = serde_json::from_value(value.clone()).unwrap();
            if record.market.orders.contains_key(&42) {
                persisted = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(persisted, "proxied order was not persisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_disconnect_yields_exactly_one_error() {
    let (shared, addr, _store) = start_broker().await;
    seed_market(&shared, 4711).await;

    let mut handler = Client::connect(addr).await;
    handler
        .send(
            &Message::RegisterHandler(RegisterRequest {
                kind: SupervisedKind::Market,
                pid: 4711,
            }),
            1,
        )
        .await;
    let (_, _register_response) = handler.recv().await;
    let (_, _refresh_push) = handler.recv().await;

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(3).await;
    select_market(&mut user, 1).await;

    user.send(
        &Message::CreateEntity(EntityPayload::MarketOrder(order_request())),
        33,
    )
    .await;
    let (_, _proxied) = handler.recv().await;
    drop(handler);

    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 33);
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(err.message, "Handler disconnected.");
    assert_eq!(
        err.entity,
        Some(EntityRef::new(EntityKind::MarketOrder, 0))
    );

    // The demoted market is broadcast to the owner's connections, and then
    // nothing else: no double response for the proxied call.
    let (_, message) = user.recv().await;
    assert!(matches!(
        message,
        Message::UpdateEntity(EntityPayload::Market(_))
    ));
    user.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_proxy_times_out_once_and_late_response_is_dropped() {
    // Dedicated broker with a short proxy timeout.
    let store = MemoryStore::new();
    let shared = BrokerShared::connect(Arc::new(store), Duration::from_millis(200))
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
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&shared))
        .await
        .expect("bind");
    let addr = server.local_addr().expect("addr");
    tokio::spawn(server.run());
    seed_market(&shared, 4711).await;

    let mut handler = Client::connect(addr).await;
    handler
        .send(
            &Message::RegisterHandler(RegisterRequest {
                kind: SupervisedKind::Market,
                pid: 4711,
            }),
            1,
        )
        .await;
    let (_, _register_response) = handler.recv().await;
    let (_, _refresh_push) = handler.recv().await;

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(3).await;
    select_market(&mut user, 1).await;

    user.send(
        &Message::CreateEntity(EntityPayload::MarketOrder(order_request())),
        44,
    )
    .await;
    let (correlation_id, _proxied) = handler.recv().await;

    // The handler stays connected but never answers.
    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 44);
    let Message::ErrorResponse(err) = message else {
        panic!("expected timeout error, got {message:?}");
    };
    assert_eq!(err.message, "Handler timeout.");

    // A response arriving after the timeout finds no correlation entry.
    let mut accepted = order_request();
    accepted.id = 42;
    handler
        .send(
            &Message::CreateEntityResponse(EntityPayload::MarketOrder(accepted)),
            correlation_id,
        )
        .await;
    user.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn call_without_handler_fails_immediately() {
    let (shared, addr, _store) = start_broker().await;
    seed_market(&shared, 4711).await;

    let mut user = Client::connect(addr).await;
    user.authenticate("kay").await;
    user.drain_snapshot(3).await;
    select_market(&mut user, 1).await;

    user.send(
        &Message::CreateEntity(EntityPayload::MarketOrder(order_request())),
        5,
    )
    .await;
    let (request_id, message) = user.recv().await;
    assert_eq!(request_id, 5);
    let Message::ErrorResponse(err) = message else {
        panic!("expected error, got {message:?}");
    };
    assert_eq!(err.message, "No market handler.");
}

async fn select_market(client: &mut Client, market_id: u64) {
    client
        .send(
            &Message::ControlEntity(ControlRequest {
                entity: EntityRef::new(EntityKind::Market, market_id),
                command: ControlCommand::Select,
            }),
            4,
        )
        .await;
    let (request_id, message) = client.recv().await;
    assert_eq!(request_id, 4);
    assert!(matches!(message, Message::ControlEntityResponse(_)));
    // The select sweeps balance, orders and transactions before replay.
    for _ in 0..3 {
        let (_, message) = client.recv().await;
        assert!(matches!(message, Message::RemoveAllEntities { .. }));
    }
}

/// Create a market directly and pretend the supervisor observed a process
/// for it, so handler processes can register against the pid.
async fn seed_market(shared: &Arc<BrokerShared>, pid: u32) {
    shared.with_directory(|directory| {
        directory
            .create_market("kay", 1, "trader", "key", "secret")
            .expect("create market");
    });
    shared
        .apply_process_pid("kay", SupervisedKind::Market, 1, Some(pid))
        .await;
}
