//! The external entity store, seen from the broker's side.
//!
//! The store is an opaque table-of-records service: tables are created by
//! name, records are JSON values with store-assigned ids, and every change
//! is fanned out to subscribers. The broker treats it as the durable system
//! of record for users, markets, sessions and the process registry; its own
//! wire protocol is not our concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod records;

pub use memory::MemoryStore;

/// Store-assigned table identifier.
pub type TableId = u32;
/// Store-assigned record identifier, unique within a table.
pub type RecordId = u64;
/// Records are opaque JSON documents.
pub type Record = Value;

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store operations. Any of these aborts only the
/// in-flight operation; [`StoreError::Disconnected`] additionally obliges
/// the caller to run a full reconnect-and-resynchronize cycle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown table {0}")]
    UnknownTable(TableId),
    #[error("unknown record {record} in table {table}")]
    UnknownRecord { table: TableId, record: RecordId },
    #[error("store connection lost")]
    Disconnected,
    #[error("store rejected the request: {0}")]
    Rejected(String),
}

/// Table names used by the broker. The store itself does not care.
pub mod tables {
    pub const USERS: &str = "users";
    pub const MARKETS: &str = "markets";
    pub const SESSIONS: &str = "sessions";
    pub const ENGINES: &str = "engines";
    pub const ADAPTERS: &str = "adapters";
    pub const PROCESSES: &str = "processes";
}

/// Change notification emitted by the store's subscription stream.
///
/// Events may arrive reordered or duplicated relative to the operations that
/// caused them; consumers reconcile from queried fact, not from deltas.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum StoreEvent {
    TableAdded {
        table: TableId,
        name: String,
    },
    RecordAdded {
        table: TableId,
        id: RecordId,
        record: Record,
    },
    RecordUpdated {
        table: TableId,
        id: RecordId,
        record: Record,
    },
    RecordRemoved {
        table: TableId,
        id: RecordId,
    },
    /// The store connection itself was lost; all cached table state is
    /// stale and must be reloaded from scratch.
    Disconnected,
}

/// Entry in the process registry table. `pid` is zero until the process
/// collaborator has actually spawned the command and reported liveness.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub command: String,
    #[serde(default)]
    pub pid: u32,
}

/// Asynchronous handle to the entity store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Create (or open) a table by name, returning its id.
    async fn create_table(&self, name: &str) -> StoreResult<TableId>;

    /// Append a record, returning the id the store assigned.
    async fn add(&self, table: TableId, record: Record) -> StoreResult<RecordId>;

    /// Replace an existing record.
    async fn update(&self, table: TableId, id: RecordId, record: Record) -> StoreResult<()>;

    /// Remove a record.
    async fn remove(&self, table: TableId, id: RecordId) -> StoreResult<()>;

    /// Fetch the full contents of a table in id order.
    async fn query(&self, table: TableId) -> StoreResult<Vec<(RecordId, Record)>>;

    /// Subscribe to change notifications for every table.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
