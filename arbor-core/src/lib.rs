//! Fundamental data types shared across the entire workspace.
//!
//! Everything in here is plain data: the broker, directory and supervisor
//! crates own the behavior. Money fields use [`rust_decimal::Decimal`],
//! timestamps are UTC, entity ids are 64-bit and never reused while the
//! parent entity lives.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod market;
pub mod session;

pub use market::Market;
pub use session::{Ledger, Session};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for amount precision.
pub type Amount = Decimal;
/// Identifier assigned to entities by the directory (or by a venue adapter
/// for market children).
pub type EntityId = u64;
/// Operating-system process id reported by the process collaborator.
pub type Pid = u32;

/// Width of the login challenge and of user key material.
pub const KEY_SIZE: usize = 32;

/// Enumerates every entity kind that can travel over the wire or live in the
/// directory.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    BotEngine,
    MarketAdapter,
    Market,
    MarketBalance,
    MarketOrder,
    MarketTransaction,
    Session,
    SessionOrder,
    SessionTransaction,
    SessionItem,
    SessionProperty,
    SessionMarker,
    SessionLogEntry,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::BotEngine => "bot engine",
            Self::MarketAdapter => "market adapter",
            Self::Market => "market",
            Self::MarketBalance => "market balance",
            Self::MarketOrder => "market order",
            Self::MarketTransaction => "market transaction",
            Self::Session => "session",
            Self::SessionOrder => "session order",
            Self::SessionTransaction => "session transaction",
            Self::SessionItem => "session item",
            Self::SessionProperty => "session property",
            Self::SessionMarker => "session marker",
            Self::SessionLogEntry => "session log entry",
        };
        f.write_str(name)
    }
}

/// Reference to one directory entity, used in error payloads and by the
/// supervisor.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    #[must_use]
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// The two entity kinds that run under a supervised child process.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisedKind {
    Market,
    Session,
}

impl SupervisedKind {
    /// The directory entity kind this maps to.
    #[must_use]
    pub fn entity_kind(self) -> EntityKind {
        match self {
            Self::Market => EntityKind::Market,
            Self::Session => EntityKind::Session,
        }
    }
}

impl fmt::Display for SupervisedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => f.write_str("market"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// The side of an order, transaction or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Run-state of a supervised market or session process.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Whether a session trades against the real venue or its own bookkeeping.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Live,
    Simulation,
}

/// Balance snapshot for one base/comm currency pair.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Balance {
    pub available_base: Amount,
    pub available_comm: Amount,
    pub reserved_base: Amount,
    pub reserved_comm: Amount,
    pub fee: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Balance {
    /// Seed a fresh balance holding only the supplied available amounts.
    #[must_use]
    pub fn seeded(base: Amount, comm: Amount) -> Self {
        Self {
            available_base: base,
            available_comm: comm,
            ..Self::default()
        }
    }
}

/// An open or historical order.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Order {
    pub id: EntityId,
    pub side: Side,
    pub price: Price,
    pub amount: Amount,
    pub fee: Amount,
    /// Seconds after which the owning process abandons the order.
    pub timeout: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// A settled trade.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Transaction {
    pub id: EntityId,
    pub side: Side,
    pub price: Price,
    pub amount: Amount,
    pub fee: Amount,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a session item (one tracked position slot).
///
/// Buy-first items cycle `WaitBuy -> Buying -> WaitSell -> Selling` and back;
/// sell-first items run the mirrored cycle starting at `WaitSell`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    WaitBuy,
    Buying,
    WaitSell,
    Selling,
}

impl ItemState {
    /// The state a freshly created item starts in, per its leading side.
    #[must_use]
    pub fn initial_for(side: Side) -> Self {
        match side {
            Side::Buy => Self::WaitBuy,
            Side::Sell => Self::WaitSell,
        }
    }

    /// The next state in the cycle.
    #[must_use]
    pub fn advance(self) -> Self {
        match self {
            Self::WaitBuy => Self::Buying,
            Self::Buying => Self::WaitSell,
            Self::WaitSell => Self::Selling,
            Self::Selling => Self::WaitBuy,
        }
    }
}

/// One tracked position slot of a session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Item {
    pub id: EntityId,
    /// Which side the item leads with.
    pub side: Side,
    pub state: ItemState,
    pub price: Price,
    pub profitable_price: Price,
    /// Price at which the strategy flips the item to its closing side.
    pub flip_price: Price,
    pub amount: Amount,
    /// Order currently working this item, when one is in flight.
    pub order_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
}

/// Named tunable value surfaced by a bot engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Property {
    pub id: EntityId,
    pub name: String,
    pub value: String,
    pub unit: Option<String>,
    /// Read-only properties reject user edits.
    pub read_only: bool,
}

/// Chart annotation kinds emitted by bot engines.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Buy,
    Sell,
    BuyAttempt,
    SellAttempt,
    GoodBuy,
    GoodSell,
}

/// Chart annotation emitted by a bot engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Marker {
    pub id: EntityId,
    pub kind: MarkerKind,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log line attached to a session.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: EntityId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Catalog entry for a pluggable trading strategy.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BotEngine {
    pub id: EntityId,
    pub name: String,
    pub executable: String,
}

/// Catalog entry for a pluggable venue integration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketAdapter {
    pub id: EntityId,
    pub name: String,
    pub executable: String,
    pub currency_base: String,
    pub currency_comm: String,
}

/// An account known to the broker, together with the markets and sessions it
/// owns. Key material never leaves the broker except for the public salt
/// returned at login.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct User {
    pub name: String,
    /// Public salt handed to the client at login.
    pub key: [u8; KEY_SIZE],
    /// HMAC key used to verify the login challenge signature.
    pub secret: [u8; KEY_SIZE],
    pub markets: BTreeMap<EntityId, Market>,
    pub sessions: BTreeMap<EntityId, Session>,
    pub next_market_id: EntityId,
    pub next_session_id: EntityId,
}

impl User {
    /// Create an account with no markets or sessions.
    #[must_use]
    pub fn new(name: impl Into<String>, key: [u8; KEY_SIZE], secret: [u8; KEY_SIZE]) -> Self {
        Self {
            name: name.into(),
            key,
            secret,
            markets: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_market_id: 1,
            next_session_id: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_state_cycles_per_leading_side() {
        let mut state = ItemState::initial_for(Side::Buy);
        assert_eq!(state, ItemState::WaitBuy);
        for expected in [
            ItemState::Buying,
            ItemState::WaitSell,
            ItemState::Selling,
            ItemState::WaitBuy,
        ] {
            state = state.advance();
            assert_eq!(state, expected);
        }

        assert_eq!(ItemState::initial_for(Side::Sell), ItemState::WaitSell);
    }

    #[test]
    fn side_inverse_round_trips() {
        assert_eq!(Side::Buy.inverse(), Side::Sell);
        assert_eq!(Side::Sell.inverse().inverse(), Side::Sell);
    }

    #[test]
    fn balance_seeded_only_fills_available() {
        let balance = Balance::seeded(Decimal::new(100, 0), Decimal::ONE);
        assert_eq!(balance.available_base, Decimal::new(100, 0));
        assert_eq!(balance.reserved_base, Decimal::ZERO);
        assert_eq!(balance.reserved_comm, Decimal::ZERO);
    }

    #[test]
    fn entity_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EntityKind::SessionLogEntry).unwrap();
        assert_eq!(json, "\"session_log_entry\"");
    }
}
