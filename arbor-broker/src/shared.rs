//! State shared by every connection task: the directory, the correlator,
//! the viewer/handler bindings and the persistence plumbing.
//!
//! One mutex guards all of it. Critical sections are synchronous and only
//! touch maps; socket writes go through unbounded queues and store writes
//! happen after the lock is released, so the lock is never held across an
//! await point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use arbor_core::{
    EntityId, EntityKind, EntityRef, Market, Pid, RunState, Session, SupervisedKind, User,
};
use arbor_directory::{Directory, DirectoryError};
use arbor_protocol::{ErrorResponse, Frame, MarketInfo, Message, MessageType, SessionInfo};
use arbor_store::records::{MarketRecord, SessionRecord, UserRecord};
use arbor_store::{tables, EntityStore, RecordId, TableId};

use crate::correlate::{CorrelationEntry, Correlator};
use crate::registry::{ConnId, ConnectionRegistry};
use crate::BrokerResult;

/// Fully qualified entity reference: ids are scoped per owning user.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EntityKey {
    pub user: String,
    pub entity: EntityRef,
}

impl EntityKey {
    #[must_use]
    pub fn new(user: impl Into<String>, kind: EntityKind, id: EntityId) -> Self {
        Self {
            user: user.into(),
            entity: EntityRef::new(kind, id),
        }
    }
}

#[derive(Default)]
struct Bindings {
    /// Authenticated UI connections per user.
    user_conns: HashMap<String, HashSet<ConnId>>,
    /// Connections receiving child-entity updates for a market or session.
    viewers: HashMap<EntityKey, HashSet<ConnId>>,
    /// The single handler connection per market or session.
    handlers: HashMap<EntityKey, ConnId>,
}

impl Bindings {
    fn drop_conn(&mut self, conn: ConnId) -> Option<EntityKey> {
        for conns in self.user_conns.values_mut() {
            conns.remove(&conn);
        }
        for conns in self.viewers.values_mut() {
            conns.remove(&conn);
        }
        let handled = self
            .handlers
            .iter()
            .find(|(_, bound)| **bound == conn)
            .map(|(key, _)| key.clone());
        if let Some(key) = &handled {
            self.handlers.remove(key);
        }
        handled
    }
}

struct State {
    directory: Directory,
    bindings: Bindings,
    correlator: Correlator,
}

#[derive(Clone, Copy)]
struct StoreTables {
    users: TableId,
    markets: TableId,
    sessions: TableId,
}

/// Shared broker state; one instance per server.
pub struct BrokerShared {
    state: Mutex<State>,
    record_ids: Mutex<HashMap<EntityKey, RecordId>>,
    user_record_ids: Mutex<HashMap<String, RecordId>>,
    pub registry: ConnectionRegistry,
    store: Arc<dyn EntityStore>,
    store_tables: StoreTables,
    proxy_timeout: Duration,
}

impl BrokerShared {
    /// Open the store tables and load everything they hold.
    pub async fn connect(
        store: Arc<dyn EntityStore>,
        proxy_timeout: Duration,
    ) -> BrokerResult<Arc<Self>> {
        let store_tables = StoreTables {
            users: store.create_table(tables::USERS).await?,
            markets: store.create_table(tables::MARKETS).await?,
            sessions: store.create_table(tables::SESSIONS).await?,
        };
        let shared = Arc::new(Self {
            state: Mutex::new(State {
                directory: Directory::new(),
                bindings: Bindings::default(),
                correlator: Correlator::new(),
            }),
            record_ids: Mutex::new(HashMap::new()),
            user_record_ids: Mutex::new(HashMap::new()),
            registry: ConnectionRegistry::new(),
            store,
            store_tables,
            proxy_timeout,
        });
        shared.resynchronize().await?;
        Ok(shared)
    }

    /// Reload every table from scratch, replacing the in-memory model. Run
    /// at startup and after the store connection is re-established; catalog
    /// entries are config-derived and survive as-is.
    pub async fn resynchronize(&self) -> BrokerResult<()> {
        let users = self.store.query(self.store_tables.users).await?;
        let markets = self.store.query(self.store_tables.markets).await?;
        let sessions = self.store.query(self.store_tables.sessions).await?;

        let mut user_records = HashMap::new();
        let mut record_ids = HashMap::new();
        {
            let mut state = self.state.lock();
            for user in state.directory.users().map(|u| u.name.clone()).collect::<Vec<_>>() {
                let _ = state.directory.remove_user(&user);
            }
            for (record_id, value) in users {
                let Ok(record) = serde_json::from_value::<UserRecord>(value) else {
                    warn!(record_id, "skipping malformed user record");
                    continue;
                };
                user_records.insert(record.name.clone(), record_id);
                state
                    .directory
                    .insert_user(User::new(record.name, record.key, record.secret));
            }
            for (record_id, value) in markets {
                let Ok(record) = serde_json::from_value::<MarketRecord>(value) else {
                    warn!(record_id, "skipping malformed market record");
                    continue;
                };
                let key =
                    EntityKey::new(record.user.clone(), EntityKind::Market, record.market.id);
                if state
                    .directory
                    .restore_market(&record.user, record.market)
                    .is_ok()
                {
                    record_ids.insert(key, record_id);
                }
            }
            for (record_id, value) in sessions {
                let Ok(record) = serde_json::from_value::<SessionRecord>(value) else {
                    warn!(record_id, "skipping malformed session record");
                    continue;
                };
                let key =
                    EntityKey::new(record.user.clone(), EntityKind::Session, record.session.id);
                if state
                    .directory
                    .restore_session(&record.user, record.session)
                    .is_ok()
                {
                    record_ids.insert(key, record_id);
                }
            }
        }
        *self.user_record_ids.lock() = user_records;
        *self.record_ids.lock() = record_ids;
        Ok(())
    }

    /// Seed the engine and adapter catalogs from configuration.
    pub fn seed_catalog(
        &self,
        engines: impl IntoIterator<Item = (String, String)>,
        adapters: impl IntoIterator<Item = (String, String, String, String)>,
    ) {
        let mut state = self.state.lock();
        for (name, executable) in engines {
            state.directory.register_engine(name, executable);
        }
        for (name, executable, base, comm) in adapters {
            state.directory.register_adapter(name, executable, base, comm);
        }
    }

    /// Create an account unless one with this name already exists.
    pub async fn provision_user(&self, user: User) -> BrokerResult<()> {
        let name = user.name.clone();
        {
            let mut state = self.state.lock();
            if state.directory.user(&name).is_ok() {
                return Ok(());
            }
            state.directory.insert_user(user.clone());
        }
        let record = serde_json::to_value(UserRecord {
            name: name.clone(),
            key: user.key,
            secret: user.secret,
        })
        .expect("user record serialization");
        let record_id = self.store.add(self.store_tables.users, record).await?;
        self.user_record_ids.lock().insert(name, record_id);
        Ok(())
    }

    /// Run a closure under the state lock. The closure must not block.
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut DirectoryAccess<'_>) -> T) -> T {
        let mut state = self.state.lock();
        let mut access = DirectoryAccess { state: &mut state };
        f(&mut access)
    }

    /// Direct access to the directory under the broker lock, for embedders
    /// that seed or inspect state outside the protocol path. The closure
    /// must not block.
    pub fn with_directory<T>(&self, f: impl FnOnce(&mut Directory) -> T) -> T {
        let mut state = self.state.lock();
        f(&mut state.directory)
    }

    // --- outbound ----------------------------------------------------------

    pub fn send(&self, conn: ConnId, message: &Message, request_id: u32) {
        self.registry.send(conn, message, request_id);
    }

    pub fn send_frame(&self, conn: ConnId, frame: Frame) {
        self.registry.send_frame(conn, frame);
    }

    /// Notify every UI connection of a user, optionally excluding one.
    pub fn broadcast_user(&self, user: &str, message: &Message, except: Option<ConnId>) {
        let conns: Vec<ConnId> = {
            let state = self.state.lock();
            state
                .bindings
                .user_conns
                .get(user)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        let frame = message.encode(0);
        for conn in conns {
            if Some(conn) != except {
                self.send_frame(conn, frame.clone());
            }
        }
    }

    /// Notify every viewer of an entity, optionally excluding one.
    pub fn broadcast_viewers(&self, key: &EntityKey, message: &Message, except: Option<ConnId>) {
        let conns: Vec<ConnId> = {
            let state = self.state.lock();
            state
                .bindings
                .viewers
                .get(key)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        };
        let frame = message.encode(0);
        for conn in conns {
            if Some(conn) != except {
                self.send_frame(conn, frame.clone());
            }
        }
    }

    // --- bindings ----------------------------------------------------------

    pub fn bind_user_conn(&self, conn: ConnId, user: &str) {
        self.state
            .lock()
            .bindings
            .user_conns
            .entry(user.to_string())
            .or_default()
            .insert(conn);
    }

    pub fn add_viewer(&self, conn: ConnId, key: EntityKey) {
        self.state
            .lock()
            .bindings
            .viewers
            .entry(key)
            .or_default()
            .insert(conn);
    }

    pub fn remove_viewer(&self, conn: ConnId, key: &EntityKey) {
        if let Some(set) = self.state.lock().bindings.viewers.get_mut(key) {
            set.remove(&conn);
        }
    }

    /// Bind `conn` as the entity's handler. Returns false when one is
    /// already attached; the first handler stays bound.
    pub fn bind_handler(&self, conn: ConnId, key: EntityKey) -> bool {
        let mut state = self.state.lock();
        if state.bindings.handlers.contains_key(&key) {
            return false;
        }
        state.bindings.handlers.insert(key.clone(), conn);
        state.bindings.viewers.entry(key).or_default().insert(conn);
        true
    }

    #[must_use]
    pub fn handler_of(&self, key: &EntityKey) -> Option<ConnId> {
        self.state.lock().bindings.handlers.get(key).copied()
    }

    #[must_use]
    pub fn handler_attached(&self, key: &EntityKey) -> bool {
        self.handler_of(key).is_some()
    }

    // --- proxying ----------------------------------------------------------

    /// Park a proxied request in the correlator, returning its correlation
    /// id. The router sends the request and arms the timeout.
    pub fn propose_correlation(
        &self,
        requester: ConnId,
        requester_request_id: u32,
        responder: ConnId,
        origin: MessageType,
        entity: Option<EntityRef>,
    ) -> u32 {
        let mut state = self.state.lock();
        state
            .correlator
            .propose(requester, requester_request_id, responder, origin, entity)
    }

    /// Consume a parked correlation entry for an arriving response.
    pub fn resolve(&self, correlation_id: u32) -> Option<CorrelationEntry> {
        self.state.lock().correlator.resolve(correlation_id)
    }

    /// Reap a correlation entry whose response never came and fail the
    /// caller with a synthetic error.
    pub fn expire_correlation(&self, correlation_id: u32) {
        let expired = self.state.lock().correlator.resolve(correlation_id);
        if let Some(entry) = expired {
            debug!(correlation_id, "proxied request timed out");
            self.send_correlation_error(&entry, "Handler timeout.");
        }
    }

    /// Seconds a proxied call may stay unanswered.
    #[must_use]
    pub fn proxy_timeout(&self) -> Duration {
        self.proxy_timeout
    }

    fn send_correlation_error(&self, entry: &CorrelationEntry, message: &str) {
        if !self.registry.contains(entry.requester) {
            return;
        }
        self.send(
            entry.requester,
            &Message::ErrorResponse(ErrorResponse {
                message_type: entry.origin,
                entity: entry.entity,
                message: message.to_string(),
            }),
            entry.requester_request_id,
        );
    }

    // --- lifecycle ---------------------------------------------------------

    /// Tear down everything a closed connection was bound to and notify the
    /// parties it leaves behind.
    pub fn disconnect(&self, conn: ConnId) {
        self.registry.remove(conn);
        let (handled, orphans) = {
            let mut state = self.state.lock();
            let handled = state.bindings.drop_conn(conn);
            let orphans = state.correlator.invalidate_all(conn);
            (handled, orphans)
        };
        for entry in &orphans {
            self.send_correlation_error(entry, "Handler disconnected.");
        }
        if let Some(key) = handled {
            debug!(user = %key.user, entity = %key.entity, "handler connection lost");
            self.broadcast_entity(&key, None);
        }
    }

    /// Broadcast the current flat state of a market or session to the
    /// owner's UI connections.
    pub fn broadcast_entity(&self, key: &EntityKey, except: Option<ConnId>) {
        let message = {
            let state = self.state.lock();
            match key.entity.kind {
                EntityKind::Market => state
                    .directory
                    .market(&key.user, key.entity.id)
                    .ok()
                    .map(|market| Message::UpdateEntity(market_payload(market))),
                EntityKind::Session => state
                    .directory
                    .session(&key.user, key.entity.id)
                    .ok()
                    .map(|session| Message::UpdateEntity(session_payload(session))),
                _ => None,
            }
        };
        if let Some(message) = message {
            self.broadcast_user(&key.user, &message, except);
        }
    }

    // --- supervision-facing operations -------------------------------------

    /// Write a run-state decided by the supervisor, broadcast it and
    /// persist.
    pub async fn apply_run_state(
        &self,
        user: &str,
        kind: SupervisedKind,
        id: EntityId,
        run_state: RunState,
    ) {
        let ok = {
            let mut state = self.state.lock();
            match kind {
                SupervisedKind::Market => {
                    state.directory.set_market_run_state(user, id, run_state)
                }
                SupervisedKind::Session => {
                    state.directory.set_session_run_state(user, id, run_state)
                }
            }
            .is_ok()
        };
        if !ok {
            return;
        }
        let key = EntityKey::new(user, kind.entity_kind(), id);
        self.broadcast_entity(&key, None);
        self.persist(&key).await;
    }

    /// Record the process id the supervisor observed for an entity.
    pub async fn apply_process_pid(
        &self,
        user: &str,
        kind: SupervisedKind,
        id: EntityId,
        pid: Option<Pid>,
    ) {
        let ok = {
            let mut state = self.state.lock();
            state.directory.set_supervised_pid(user, kind, id, pid).is_ok()
        };
        if ok {
            self.persist(&EntityKey::new(user, kind.entity_kind(), id)).await;
        }
    }

    /// A tracked process vanished without a stop request: force the entity
    /// to stopped and treat its handler connection as disconnected.
    pub async fn process_vanished(&self, user: &str, kind: SupervisedKind, id: EntityId) {
        let key = EntityKey::new(user, kind.entity_kind(), id);
        let (handler, orphans) = {
            let mut state = self.state.lock();
            let _ = state.directory.set_supervised_pid(user, kind, id, None);
            let _ = match kind {
                SupervisedKind::Market => {
                    state
                        .directory
                        .set_market_run_state(user, id, RunState::Stopped)
                }
                SupervisedKind::Session => {
                    state
                        .directory
                        .set_session_run_state(user, id, RunState::Stopped)
                }
            };
            let handler = state.bindings.handlers.remove(&key);
            let orphans = match handler {
                Some(conn) => state.correlator.invalidate_all(conn),
                None => Vec::new(),
            };
            (handler, orphans)
        };
        for entry in &orphans {
            self.send_correlation_error(entry, "Handler disconnected.");
        }
        if let Some(conn) = handler {
            debug!(user, %id, "detached handler of vanished process");
            // The handler socket itself will close on its own; from the
            // broker's side it is no longer a handler.
            self.remove_viewer(conn, &key);
        }
        self.broadcast_entity(&key, None);
        self.persist(&key).await;
    }

    // --- persistence -------------------------------------------------------

    fn snapshot_record(&self, key: &EntityKey) -> Option<serde_json::Value> {
        let state = self.state.lock();
        match key.entity.kind {
            EntityKind::Market => {
                let market = state.directory.market(&key.user, key.entity.id).ok()?;
                let executable = state
                    .directory
                    .adapter(market.adapter_id)
                    .map(|adapter| adapter.executable.clone())
                    .unwrap_or_default();
                serde_json::to_value(MarketRecord {
                    user: key.user.clone(),
                    executable,
                    market: market.clone(),
                })
                .ok()
            }
            EntityKind::Session => {
                let session = state.directory.session(&key.user, key.entity.id).ok()?;
                let executable = state
                    .directory
                    .engine(session.engine_id)
                    .map(|engine| engine.executable.clone())
                    .unwrap_or_default();
                serde_json::to_value(SessionRecord {
                    user: key.user.clone(),
                    executable,
                    session: session.clone(),
                })
                .ok()
            }
            _ => None,
        }
    }

    /// Write the entity behind `key` to the store. A failed store call
    /// aborts only this write; the next mutation retries the record.
    pub async fn persist(&self, key: &EntityKey) {
        let Some(record) = self.snapshot_record(key) else {
            return;
        };
        let table = match key.entity.kind {
            EntityKind::Market => self.store_tables.markets,
            EntityKind::Session => self.store_tables.sessions,
            _ => return,
        };
        let existing = self.record_ids.lock().get(key).copied();
        let result = match existing {
            Some(record_id) => self.store.update(table, record_id, record).await,
            None => match self.store.add(table, record).await {
                Ok(record_id) => {
                    self.record_ids.lock().insert(key.clone(), record_id);
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            warn!(entity = %key.entity, user = %key.user, error = %err, "store write failed");
        }
    }

    /// Drop the persisted record of a removed entity.
    pub async fn persist_removal(&self, key: &EntityKey) {
        let table = match key.entity.kind {
            EntityKind::Market => self.store_tables.markets,
            EntityKind::Session => self.store_tables.sessions,
            _ => return,
        };
        let record_id = self.record_ids.lock().remove(key);
        if let Some(record_id) = record_id {
            if let Err(err) = self.store.remove(table, record_id).await {
                warn!(entity = %key.entity, error = %err, "store remove failed");
            }
        }
    }

}

/// Narrow view handed to closures running under the state lock.
pub(crate) struct DirectoryAccess<'a> {
    state: &'a mut State,
}

impl DirectoryAccess<'_> {
    pub fn directory(&mut self) -> &mut Directory {
        &mut self.state.directory
    }

    pub fn directory_ref(&self) -> &Directory {
        &self.state.directory
    }
}

/// Flat wire view of a market aggregate.
#[must_use]
pub fn market_payload(market: &Market) -> arbor_protocol::EntityPayload {
    arbor_protocol::EntityPayload::Market(MarketInfo {
        id: market.id,
        adapter_id: market.adapter_id,
        venue_user_name: market.venue_user_name.clone(),
        api_key: market.api_key.clone(),
        api_secret: market.api_secret.clone(),
        run_state: market.run_state,
    })
}

/// Flat wire view of a session aggregate.
#[must_use]
pub fn session_payload(session: &Session) -> arbor_protocol::EntityPayload {
    arbor_protocol::EntityPayload::Session(SessionInfo {
        id: session.id,
        name: session.name.clone(),
        engine_id: session.engine_id,
        market_id: session.market_id,
        simulation: session.mode == arbor_core::OperatingMode::Simulation,
        run_state: session.run_state,
        balance: session.ledger().balance.clone(),
    })
}

/// Map a directory failure onto the wire error wording.
#[must_use]
pub fn directory_error_message(err: &DirectoryError) -> String {
    match err {
        DirectoryError::NotFound(entity) => match entity.kind {
            EntityKind::Market => "Unknown market.".into(),
            EntityKind::Session => "Unknown session.".into(),
            EntityKind::MarketAdapter => "Unknown market adapter.".into(),
            EntityKind::BotEngine => "Unknown bot engine.".into(),
            _ => format!("Unknown {}.", entity.kind),
        },
        DirectoryError::UnknownUser(_) => "Unknown user.".into(),
        DirectoryError::ReadOnly(_) => "Property is not editable.".into(),
        DirectoryError::InvalidState { reason, .. } => (*reason).to_string(),
        DirectoryError::HandlerAttached(_) => {
            "Cannot switch mode while a handler is attached.".into()
        }
    }
}
