//! The session aggregate: one bot-engine instance trading a market, with a
//! live ledger and an optional simulation ledger.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    Amount, Balance, EntityId, Item, LogEntry, Marker, OperatingMode, Order, Pid, Property,
    RunState, Transaction,
};

/// The five mutable collections of a session plus its balance, grouped so
/// that simulation can run against a disposable copy.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Ledger {
    pub balance: Balance,
    pub transactions: BTreeMap<EntityId, Transaction>,
    pub items: BTreeMap<EntityId, Item>,
    pub properties: BTreeMap<EntityId, Property>,
    pub orders: BTreeMap<EntityId, Order>,
    pub markers: BTreeMap<EntityId, Marker>,
    pub log: Vec<LogEntry>,
}

impl Ledger {
    /// A fresh ledger holding only the supplied starting balance.
    #[must_use]
    pub fn seeded(base: Amount, comm: Amount) -> Self {
        Self {
            balance: Balance::seeded(base, comm),
            ..Self::default()
        }
    }
}

/// One bot-engine instance bound to a market.
///
/// Exactly one ledger is active at a time, selected by [`OperatingMode`]:
/// the live ledger always exists, the simulation ledger only while the
/// session is in simulation mode. Entering simulation creates a fresh
/// seeded ledger; returning to live drops it, so live history survives any
/// simulation excursion untouched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub id: EntityId,
    pub name: String,
    pub engine_id: EntityId,
    pub market_id: EntityId,
    pub mode: OperatingMode,
    pub run_state: RunState,
    /// Process id of the bot instance serving this session, once the
    /// supervisor has observed one.
    pub pid: Option<Pid>,
    pub initial_balance_base: Amount,
    pub initial_balance_comm: Amount,
    live: Ledger,
    simulation: Option<Ledger>,
    next_child_id: EntityId,
}

impl Session {
    #[must_use]
    pub fn new(
        id: EntityId,
        name: impl Into<String>,
        engine_id: EntityId,
        market_id: EntityId,
        initial_balance_base: Amount,
        initial_balance_comm: Amount,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            engine_id,
            market_id,
            mode: OperatingMode::Live,
            run_state: RunState::Stopped,
            pid: None,
            initial_balance_base,
            initial_balance_comm,
            live: Ledger::seeded(initial_balance_base, initial_balance_comm),
            simulation: None,
            next_child_id: 1,
        }
    }

    /// Allocate the next child id. Ids are shared across all five
    /// collections and never reused while the session lives.
    pub fn allocate_child_id(&mut self) -> EntityId {
        let id = self.next_child_id;
        self.next_child_id += 1;
        id
    }

    /// The ledger currently surfaced to viewers.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        match self.mode {
            OperatingMode::Live => &self.live,
            OperatingMode::Simulation => self
                .simulation
                .as_ref()
                .expect("simulation mode without a simulation ledger"),
        }
    }

    /// Mutable access to the active ledger.
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        match self.mode {
            OperatingMode::Live => &mut self.live,
            OperatingMode::Simulation => self
                .simulation
                .as_mut()
                .expect("simulation mode without a simulation ledger"),
        }
    }

    /// Switch to simulation mode against a fresh seeded ledger. The live
    /// ledger is left untouched. No-op when already simulating.
    pub fn activate_simulation(&mut self) {
        if self.mode == OperatingMode::Simulation {
            return;
        }
        self.simulation = Some(Ledger::seeded(
            self.initial_balance_base,
            self.initial_balance_comm,
        ));
        self.mode = OperatingMode::Simulation;
    }

    /// Switch back to live mode, discarding whatever the simulation
    /// produced. No-op when already live.
    pub fn activate_live(&mut self) {
        if self.mode == OperatingMode::Live {
            return;
        }
        self.simulation = None;
        self.mode = OperatingMode::Live;
    }
}
