//! In-memory owner of all users, markets and sessions.
//!
//! Pure bookkeeping: strict id allocation, referential checks and typed
//! failures. No network or persistence logic lives here — the broker
//! broadcasts and persists after every successful mutation, and the
//! supervisor drives run-state transitions through the setters at the
//! bottom.

use std::collections::BTreeMap;

use arbor_core::{
    Amount, Balance, BotEngine, EntityId, EntityKind, EntityRef, Item, ItemState, LogEntry, Market,
    MarketAdapter, Marker, Order, Pid, Property, RunState, Session, SupervisedKind, Transaction,
    User,
};
use thiserror::Error;

pub mod snapshot;

/// Convenience alias for directory results.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Typed failures returned by directory operations.
#[derive(Debug, Error, PartialEq)]
pub enum DirectoryError {
    #[error("unknown {0}")]
    NotFound(EntityRef),
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("property {0} is read-only")]
    ReadOnly(EntityRef),
    #[error("{entity}: {reason}")]
    InvalidState {
        entity: EntityRef,
        reason: &'static str,
    },
    #[error("cannot switch mode of {0} while a handler is attached")]
    HandlerAttached(EntityRef),
}

fn not_found(kind: EntityKind, id: EntityId) -> DirectoryError {
    DirectoryError::NotFound(EntityRef::new(kind, id))
}

/// The authoritative in-memory model. One instance per broker, mutated only
/// under the broker's lock.
#[derive(Debug, Default)]
pub struct Directory {
    users: BTreeMap<String, User>,
    engines: BTreeMap<EntityId, BotEngine>,
    adapters: BTreeMap<EntityId, MarketAdapter>,
    next_engine_id: EntityId,
    next_adapter_id: EntityId,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_engine_id: 1,
            next_adapter_id: 1,
            ..Self::default()
        }
    }

    // --- catalog -----------------------------------------------------------

    /// Register a bot engine from the configured catalog.
    pub fn register_engine(
        &mut self,
        name: impl Into<String>,
        executable: impl Into<String>,
    ) -> &BotEngine {
        let id = self.next_engine_id;
        self.next_engine_id += 1;
        self.engines.entry(id).or_insert(BotEngine {
            id,
            name: name.into(),
            executable: executable.into(),
        })
    }

    /// Register a market adapter from the configured catalog.
    pub fn register_adapter(
        &mut self,
        name: impl Into<String>,
        executable: impl Into<String>,
        currency_base: impl Into<String>,
        currency_comm: impl Into<String>,
    ) -> &MarketAdapter {
        let id = self.next_adapter_id;
        self.next_adapter_id += 1;
        self.adapters.entry(id).or_insert(MarketAdapter {
            id,
            name: name.into(),
            executable: executable.into(),
            currency_base: currency_base.into(),
            currency_comm: currency_comm.into(),
        })
    }

    #[must_use]
    pub fn engines(&self) -> impl Iterator<Item = &BotEngine> {
        self.engines.values()
    }

    #[must_use]
    pub fn adapters(&self) -> impl Iterator<Item = &MarketAdapter> {
        self.adapters.values()
    }

    pub fn engine(&self, id: EntityId) -> DirectoryResult<&BotEngine> {
        self.engines
            .get(&id)
            .ok_or_else(|| not_found(EntityKind::BotEngine, id))
    }

    pub fn adapter(&self, id: EntityId) -> DirectoryResult<&MarketAdapter> {
        self.adapters
            .get(&id)
            .ok_or_else(|| not_found(EntityKind::MarketAdapter, id))
    }

    // --- users -------------------------------------------------------------

    /// Insert an account, replacing any previous one under the same name.
    /// Account provisioning itself is external to the broker.
    pub fn insert_user(&mut self, user: User) {
        self.users.insert(user.name.clone(), user);
    }

    pub fn user(&self, name: &str) -> DirectoryResult<&User> {
        self.users
            .get(name)
            .ok_or_else(|| DirectoryError::UnknownUser(name.to_string()))
    }

    pub fn user_mut(&mut self, name: &str) -> DirectoryResult<&mut User> {
        self.users
            .get_mut(name)
            .ok_or_else(|| DirectoryError::UnknownUser(name.to_string()))
    }

    #[must_use]
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Remove a user together with every market and session it owns.
    pub fn remove_user(&mut self, name: &str) -> DirectoryResult<User> {
        self.users
            .remove(name)
            .ok_or_else(|| DirectoryError::UnknownUser(name.to_string()))
    }

    // --- markets -----------------------------------------------------------

    /// Create a market for `user` against a registered adapter.
    pub fn create_market(
        &mut self,
        user: &str,
        adapter_id: EntityId,
        venue_user_name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> DirectoryResult<&Market> {
        if !self.adapters.contains_key(&adapter_id) {
            return Err(not_found(EntityKind::MarketAdapter, adapter_id));
        }
        let owner = self.user_mut(user)?;
        let id = owner.next_market_id;
        owner.next_market_id += 1;
        let market = Market::new(id, adapter_id, venue_user_name, api_key, api_secret);
        owner.markets.insert(id, market);
        Ok(&owner.markets[&id])
    }

    pub fn market(&self, user: &str, id: EntityId) -> DirectoryResult<&Market> {
        self.user(user)?
            .markets
            .get(&id)
            .ok_or_else(|| not_found(EntityKind::Market, id))
    }

    pub fn market_mut(&mut self, user: &str, id: EntityId) -> DirectoryResult<&mut Market> {
        self.user_mut(user)?
            .markets
            .get_mut(&id)
            .ok_or_else(|| not_found(EntityKind::Market, id))
    }

    /// Remove a market. Whether it is still referenced by a session is the
    /// caller's concern, not checked here.
    pub fn remove_market(&mut self, user: &str, id: EntityId) -> DirectoryResult<Market> {
        self.user_mut(user)?
            .markets
            .remove(&id)
            .ok_or_else(|| not_found(EntityKind::Market, id))
    }

    /// Re-insert a market loaded from the store, preserving its id and
    /// keeping the id allocator ahead of it.
    pub fn restore_market(&mut self, user: &str, market: Market) -> DirectoryResult<()> {
        let owner = self.user_mut(user)?;
        owner.next_market_id = owner.next_market_id.max(market.id + 1);
        owner.markets.insert(market.id, market);
        Ok(())
    }

    /// Locate the market bound to an operating-system process id.
    #[must_use]
    pub fn find_market_by_pid(&self, pid: Pid) -> Option<(&str, &Market)> {
        self.users.values().find_map(|user| {
            user.markets
                .values()
                .find(|market| market.pid == Some(pid))
                .map(|market| (user.name.as_str(), market))
        })
    }

    // --- sessions ----------------------------------------------------------

    /// Create a session for `user`, bound to one market and one engine.
    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &mut self,
        user: &str,
        name: impl Into<String>,
        engine_id: EntityId,
        market_id: EntityId,
        initial_balance_base: Amount,
        initial_balance_comm: Amount,
    ) -> DirectoryResult<&Session> {
        if !self.engines.contains_key(&engine_id) {
            return Err(not_found(EntityKind::BotEngine, engine_id));
        }
        let owner = self.user_mut(user)?;
        if !owner.markets.contains_key(&market_id) {
            return Err(not_found(EntityKind::Market, market_id));
        }
        let id = owner.next_session_id;
        owner.next_session_id += 1;
        let session = Session::new(
            id,
            name,
            engine_id,
            market_id,
            initial_balance_base,
            initial_balance_comm,
        );
        owner.sessions.insert(id, session);
        Ok(&owner.sessions[&id])
    }

    pub fn session(&self, user: &str, id: EntityId) -> DirectoryResult<&Session> {
        self.user(user)?
            .sessions
            .get(&id)
            .ok_or_else(|| not_found(EntityKind::Session, id))
    }

    pub fn session_mut(&mut self, user: &str, id: EntityId) -> DirectoryResult<&mut Session> {
        self.user_mut(user)?
            .sessions
            .get_mut(&id)
            .ok_or_else(|| not_found(EntityKind::Session, id))
    }

    pub fn remove_session(&mut self, user: &str, id: EntityId) -> DirectoryResult<Session> {
        self.user_mut(user)?
            .sessions
            .remove(&id)
            .ok_or_else(|| not_found(EntityKind::Session, id))
    }

    /// Re-insert a session loaded from the store, preserving its id and
    /// keeping the id allocator ahead of it.
    pub fn restore_session(&mut self, user: &str, session: Session) -> DirectoryResult<()> {
        let owner = self.user_mut(user)?;
        owner.next_session_id = owner.next_session_id.max(session.id + 1);
        owner.sessions.insert(session.id, session);
        Ok(())
    }

    /// Locate the session bound to an operating-system process id.
    #[must_use]
    pub fn find_session_by_pid(&self, pid: Pid) -> Option<(&str, &Session)> {
        self.users.values().find_map(|user| {
            user.sessions
                .values()
                .find(|session| session.pid == Some(pid))
                .map(|session| (user.name.as_str(), session))
        })
    }

    // --- session children --------------------------------------------------

    /// Record a transaction in the session's active ledger.
    pub fn create_session_transaction(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut transaction: Transaction,
    ) -> DirectoryResult<Transaction> {
        let session = self.session_mut(user, session_id)?;
        transaction.id = session.allocate_child_id();
        session
            .ledger_mut()
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    pub fn update_session_transaction(
        &mut self,
        user: &str,
        session_id: EntityId,
        transaction: Transaction,
    ) -> DirectoryResult<Transaction> {
        let session = self.session_mut(user, session_id)?;
        let ledger = session.ledger_mut();
        if !ledger.transactions.contains_key(&transaction.id) {
            return Err(not_found(EntityKind::SessionTransaction, transaction.id));
        }
        ledger.transactions.insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    /// Store a transaction under the id it already carries; used when a
    /// handler response echoes state the broker may not have seen yet.
    pub fn upsert_session_transaction(
        &mut self,
        user: &str,
        session_id: EntityId,
        transaction: Transaction,
    ) -> DirectoryResult<Transaction> {
        let session = self.session_mut(user, session_id)?;
        session
            .ledger_mut()
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(transaction)
    }

    pub fn remove_session_transaction(
        &mut self,
        user: &str,
        session_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?
            .ledger_mut()
            .transactions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::SessionTransaction, id))
    }

    /// Record a new item; server-assigned fields are overwritten here.
    pub fn create_session_item(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut item: Item,
    ) -> DirectoryResult<Item> {
        let session = self.session_mut(user, session_id)?;
        item.id = session.allocate_child_id();
        item.state = ItemState::initial_for(item.side);
        session.ledger_mut().items.insert(item.id, item.clone());
        Ok(item)
    }

    pub fn update_session_item(
        &mut self,
        user: &str,
        session_id: EntityId,
        item: Item,
    ) -> DirectoryResult<Item> {
        let session = self.session_mut(user, session_id)?;
        let ledger = session.ledger_mut();
        if !ledger.items.contains_key(&item.id) {
            return Err(not_found(EntityKind::SessionItem, item.id));
        }
        ledger.items.insert(item.id, item.clone());
        Ok(item)
    }

    /// Store an item under the id it already carries.
    pub fn upsert_session_item(
        &mut self,
        user: &str,
        session_id: EntityId,
        item: Item,
    ) -> DirectoryResult<Item> {
        let session = self.session_mut(user, session_id)?;
        session.ledger_mut().items.insert(item.id, item.clone());
        Ok(item)
    }

    pub fn remove_session_item(
        &mut self,
        user: &str,
        session_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?
            .ledger_mut()
            .items
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::SessionItem, id))
    }

    /// Create or refresh a property by name; bot engines own their property
    /// set and may overwrite read-only entries.
    pub fn upsert_session_property(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut property: Property,
    ) -> DirectoryResult<Property> {
        let session = self.session_mut(user, session_id)?;
        let existing = session
            .ledger()
            .properties
            .values()
            .find(|candidate| candidate.name == property.name)
            .map(|candidate| candidate.id);
        property.id = match existing {
            Some(id) => id,
            None => session.allocate_child_id(),
        };
        session
            .ledger_mut()
            .properties
            .insert(property.id, property.clone());
        Ok(property)
    }

    /// Update a property value on behalf of a user; read-only properties are
    /// rejected.
    pub fn update_session_property_value(
        &mut self,
        user: &str,
        session_id: EntityId,
        id: EntityId,
        value: String,
    ) -> DirectoryResult<Property> {
        let session = self.session_mut(user, session_id)?;
        let property = session
            .ledger_mut()
            .properties
            .get_mut(&id)
            .ok_or_else(|| not_found(EntityKind::SessionProperty, id))?;
        if property.read_only {
            return Err(DirectoryError::ReadOnly(EntityRef::new(
                EntityKind::SessionProperty,
                id,
            )));
        }
        property.value = value;
        Ok(property.clone())
    }

    pub fn remove_session_property(
        &mut self,
        user: &str,
        session_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?
            .ledger_mut()
            .properties
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::SessionProperty, id))
    }

    pub fn create_session_order(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut order: Order,
    ) -> DirectoryResult<Order> {
        let session = self.session_mut(user, session_id)?;
        order.id = session.allocate_child_id();
        session.ledger_mut().orders.insert(order.id, order.clone());
        Ok(order)
    }

    /// Store an order under the id it already carries (session orders echo
    /// venue state, so updates may arrive for ids we have not seen).
    pub fn upsert_session_order(
        &mut self,
        user: &str,
        session_id: EntityId,
        order: Order,
    ) -> DirectoryResult<Order> {
        let session = self.session_mut(user, session_id)?;
        session.ledger_mut().orders.insert(order.id, order.clone());
        Ok(order)
    }

    pub fn remove_session_order(
        &mut self,
        user: &str,
        session_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?
            .ledger_mut()
            .orders
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::SessionOrder, id))
    }

    pub fn create_session_marker(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut marker: Marker,
    ) -> DirectoryResult<Marker> {
        let session = self.session_mut(user, session_id)?;
        marker.id = session.allocate_child_id();
        session.ledger_mut().markers.insert(marker.id, marker.clone());
        Ok(marker)
    }

    pub fn append_session_log(
        &mut self,
        user: &str,
        session_id: EntityId,
        mut entry: LogEntry,
    ) -> DirectoryResult<LogEntry> {
        let session = self.session_mut(user, session_id)?;
        entry.id = session.allocate_child_id();
        session.ledger_mut().log.push(entry.clone());
        Ok(entry)
    }

    pub fn set_session_balance(
        &mut self,
        user: &str,
        session_id: EntityId,
        balance: Balance,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?.ledger_mut().balance = balance;
        Ok(())
    }

    // --- market children ---------------------------------------------------

    pub fn set_market_balance(
        &mut self,
        user: &str,
        market_id: EntityId,
        balance: Balance,
    ) -> DirectoryResult<()> {
        self.market_mut(user, market_id)?.balance = Some(balance);
        Ok(())
    }

    /// Store a market order under the id the adapter assigned.
    pub fn upsert_market_order(
        &mut self,
        user: &str,
        market_id: EntityId,
        order: Order,
    ) -> DirectoryResult<Order> {
        self.market_mut(user, market_id)?.upsert_order(order.clone());
        Ok(order)
    }

    pub fn remove_market_order(
        &mut self,
        user: &str,
        market_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.market_mut(user, market_id)?
            .orders
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::MarketOrder, id))
    }

    pub fn upsert_market_transaction(
        &mut self,
        user: &str,
        market_id: EntityId,
        transaction: Transaction,
    ) -> DirectoryResult<Transaction> {
        self.market_mut(user, market_id)?
            .upsert_transaction(transaction.clone());
        Ok(transaction)
    }

    pub fn remove_market_transaction(
        &mut self,
        user: &str,
        market_id: EntityId,
        id: EntityId,
    ) -> DirectoryResult<()> {
        self.market_mut(user, market_id)?
            .transactions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(EntityKind::MarketTransaction, id))
    }

    // --- supervision hooks -------------------------------------------------

    pub fn set_market_run_state(
        &mut self,
        user: &str,
        market_id: EntityId,
        state: RunState,
    ) -> DirectoryResult<()> {
        self.market_mut(user, market_id)?.run_state = state;
        Ok(())
    }

    pub fn set_session_run_state(
        &mut self,
        user: &str,
        session_id: EntityId,
        state: RunState,
    ) -> DirectoryResult<()> {
        self.session_mut(user, session_id)?.run_state = state;
        Ok(())
    }

    pub fn set_supervised_pid(
        &mut self,
        user: &str,
        kind: SupervisedKind,
        id: EntityId,
        pid: Option<Pid>,
    ) -> DirectoryResult<()> {
        match kind {
            SupervisedKind::Market => self.market_mut(user, id)?.pid = pid,
            SupervisedKind::Session => self.session_mut(user, id)?.pid = pid,
        }
        Ok(())
    }
}
