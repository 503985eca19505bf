//! Typed views of the records the broker keeps in the store.
//!
//! The store itself only sees JSON; these wrappers fix the shape the broker
//! and the supervisor agree on.

use arbor_core::{Market, Session, KEY_SIZE};
use serde::{Deserialize, Serialize};

/// Account credentials, written once at provisioning.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UserRecord {
    pub name: String,
    pub key: [u8; KEY_SIZE],
    pub secret: [u8; KEY_SIZE],
}

/// One market aggregate plus the context the supervisor needs to run it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MarketRecord {
    pub user: String,
    /// Executable of the configured adapter, resolved by the broker so the
    /// supervisor does not need the catalog.
    pub executable: String,
    pub market: Market,
}

/// One session aggregate plus its engine executable.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionRecord {
    pub user: String,
    pub executable: String,
    pub session: Session,
}
