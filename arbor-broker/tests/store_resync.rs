//! Losing the store connection means reloading every table from scratch;
//! the rebuilt directory must match what was persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use arbor_broker::{BrokerShared, EntityKey};
use arbor_core::{EntityKind, RunState, Side, Transaction, User};
use arbor_store::MemoryStore;

const USER_SECRET: [u8; 32] = [2; 32];

#[tokio::test]
async fn resynchronize_rebuilds_directory_from_store() {
    let store = MemoryStore::new();

    // First broker lifetime: provision and mutate.
    {
        let shared = BrokerShared::connect(Arc::new(store.clone()), Duration::from_secs(5))
            .await
            .unwrap();
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
            .unwrap();
        shared.with_directory(|directory| {
            directory
                .create_market("kay", 1, "trader", "key", "secret")
                .unwrap();
            directory
                .create_session("kay", "flip-1", 1, 1, Decimal::new(100, 0), Decimal::ZERO)
                .unwrap();
            let tx = Transaction {
                id: 0,
                side: Side::Sell,
                price: Decimal::new(305, 0),
                amount: Decimal::ONE,
                fee: Decimal::ZERO,
                created_at: Utc::now(),
            };
            directory.create_session_transaction("kay", 1, tx).unwrap();
            directory
                .set_session_run_state("kay", 1, RunState::Running)
                .unwrap();
        });
        shared
            .persist(&EntityKey::new("kay", EntityKind::Market, 1))
            .await;
        shared
            .persist(&EntityKey::new("kay", EntityKind::Session, 1))
            .await;
    }

    // Second lifetime: everything reloads from the tables. Catalogs are
    // config-derived and seeded again at startup.
    let shared = BrokerShared::connect(Arc::new(store), Duration::from_secs(5))
        .await
        .unwrap();
    shared.seed_catalog(
        [("flip".to_string(), "bots/flip".to_string())],
        [(
            "paper".to_string(),
            "markets/paper".to_string(),
            "USD".to_string(),
            "BTC".to_string(),
        )],
    );
    shared.with_directory(|directory| {
        let market = directory.market("kay", 1).unwrap();
        assert_eq!(market.venue_user_name, "trader");

        let session = directory.session("kay", 1).unwrap();
        assert_eq!(session.name, "flip-1");
        assert_eq!(session.run_state, RunState::Running);
        assert_eq!(session.ledger().transactions.len(), 1);
        assert_eq!(
            session.ledger().transactions[&1].price,
            Decimal::new(305, 0)
        );

        // Id allocators resume past restored entities.
        let next = directory
            .create_market("kay", 1, "second", "key", "secret")
            .unwrap()
            .id;
        assert_eq!(next, 2);
    });

    // Repeated resynchronization is a clean reload, not an accumulation.
    shared.resynchronize().await.unwrap();
    shared.with_directory(|directory| {
        assert_eq!(directory.user("kay").unwrap().sessions.len(), 1);
    });
}
