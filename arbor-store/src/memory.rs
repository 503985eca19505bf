//! In-process store used by tests and by the self-contained broker binary.
//!
//! Behaves like the real service as far as the broker can tell: tables by
//! name, store-assigned ids, broadcast notifications. State lives behind a
//! single mutex; critical sections only touch maps, so the lock is never
//! held across an await point.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{EntityStore, Record, RecordId, StoreError, StoreEvent, StoreResult, TableId};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Table {
    name: String,
    records: BTreeMap<RecordId, Record>,
    next_record_id: RecordId,
}

#[derive(Default)]
struct Inner {
    tables: BTreeMap<TableId, Table>,
    next_table_id: TableId,
}

/// Shared in-memory store handle; clones observe the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                tables: BTreeMap::new(),
                next_table_id: 1,
            })),
            events,
        }
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine; the broadcast just drops the event.
        let _ = self.events.send(event);
    }

    /// Simulate losing the store connection, so callers can exercise their
    /// resynchronization path.
    pub fn drop_connection(&self) {
        self.emit(StoreEvent::Disconnected);
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn create_table(&self, name: &str) -> StoreResult<TableId> {
        let (id, created) = {
            let mut inner = self.inner.lock();
            if let Some((id, _)) = inner
                .tables
                .iter()
                .find(|(_, table)| table.name == name)
            {
                (*id, false)
            } else {
                let id = inner.next_table_id;
                inner.next_table_id += 1;
                inner.tables.insert(
                    id,
                    Table {
                        name: name.to_string(),
                        records: BTreeMap::new(),
                        next_record_id: 1,
                    },
                );
                (id, true)
            }
        };
        if created {
            self.emit(StoreEvent::TableAdded {
                table: id,
                name: name.to_string(),
            });
        }
        Ok(id)
    }

    async fn add(&self, table: TableId, record: Record) -> StoreResult<RecordId> {
        let id = {
            let mut inner = self.inner.lock();
            let entry = inner
                .tables
                .get_mut(&table)
                .ok_or(StoreError::UnknownTable(table))?;
            let id = entry.next_record_id;
            entry.next_record_id += 1;
            entry.records.insert(id, record.clone());
            id
        };
        self.emit(StoreEvent::RecordAdded { table, id, record });
        Ok(id)
    }

    async fn update(&self, table: TableId, id: RecordId, record: Record) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .tables
                .get_mut(&table)
                .ok_or(StoreError::UnknownTable(table))?;
            let slot = entry
                .records
                .get_mut(&id)
                .ok_or(StoreError::UnknownRecord { table, record: id })?;
            *slot = record.clone();
        }
        self.emit(StoreEvent::RecordUpdated { table, id, record });
        Ok(())
    }

    async fn remove(&self, table: TableId, id: RecordId) -> StoreResult<()> {
        {
            let mut inner = self.inner.lock();
            let entry = inner
                .tables
                .get_mut(&table)
                .ok_or(StoreError::UnknownTable(table))?;
            entry
                .records
                .remove(&id)
                .ok_or(StoreError::UnknownRecord { table, record: id })?;
        }
        self.emit(StoreEvent::RecordRemoved { table, id });
        Ok(())
    }

    async fn query(&self, table: TableId) -> StoreResult<Vec<(RecordId, Record)>> {
        let inner = self.inner.lock();
        let entry = inner
            .tables
            .get(&table)
            .ok_or(StoreError::UnknownTable(table))?;
        Ok(entry
            .records
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
