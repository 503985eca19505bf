//! The market aggregate: one venue account driven by a market-adapter
//! process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Balance, EntityId, Order, Pid, RunState, Side, Transaction};

/// One venue account owned by a user.
///
/// Child ids (orders, transactions) are assigned by the adapter process that
/// speaks to the venue; the broker stores whatever arrives and never
/// allocates ids of its own here.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Market {
    pub id: EntityId,
    pub adapter_id: EntityId,
    /// Venue account name, as configured by the owning user.
    pub venue_user_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub balance: Option<Balance>,
    pub orders: BTreeMap<EntityId, Order>,
    pub transactions: BTreeMap<EntityId, Transaction>,
    pub run_state: RunState,
    /// Process id of the adapter instance serving this market, once the
    /// supervisor has observed one.
    pub pid: Option<Pid>,
}

impl Market {
    #[must_use]
    pub fn new(
        id: EntityId,
        adapter_id: EntityId,
        venue_user_name: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            id,
            adapter_id,
            venue_user_name: venue_user_name.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            balance: None,
            orders: BTreeMap::new(),
            transactions: BTreeMap::new(),
            run_state: RunState::Stopped,
            pid: None,
        }
    }

    /// Number of open orders on the buy side.
    #[must_use]
    pub fn open_buy_order_count(&self) -> usize {
        self.orders
            .values()
            .filter(|order| order.side == Side::Buy)
            .count()
    }

    /// Number of open orders on the sell side.
    #[must_use]
    pub fn open_sell_order_count(&self) -> usize {
        self.orders
            .values()
            .filter(|order| order.side == Side::Sell)
            .count()
    }

    /// Store an order as reported by the adapter, replacing any previous
    /// record under the same id.
    pub fn upsert_order(&mut self, order: Order) {
        self.orders.insert(order.id, order);
    }

    /// Store a transaction as reported by the adapter.
    pub fn upsert_transaction(&mut self, transaction: Transaction) {
        self.transactions.insert(transaction.id, transaction);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;

    fn order(id: EntityId, side: Side) -> Order {
        Order {
            id,
            side,
            price: Decimal::new(300, 0),
            amount: Decimal::new(2, 2),
            fee: Decimal::ZERO,
            timeout: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn open_order_counts_track_sides() {
        let mut market = Market::new(1, 1, "trader", "key", "secret");
        assert_eq!(market.open_buy_order_count(), 0);
        assert_eq!(market.open_sell_order_count(), 0);

        market.upsert_order(order(7, Side::Buy));
        assert_eq!(market.open_buy_order_count(), 1);
        assert_eq!(market.open_sell_order_count(), 0);

        market.orders.remove(&7);
        assert_eq!(market.open_buy_order_count(), 0);
    }

    #[test]
    fn upsert_order_replaces_by_id() {
        let mut market = Market::new(1, 1, "trader", "key", "secret");
        market.upsert_order(order(7, Side::Buy));
        market.upsert_order(order(7, Side::Sell));
        assert_eq!(market.orders.len(), 1);
        assert_eq!(market.open_sell_order_count(), 1);
    }
}
