//! Keeps exactly one child process running per active market and session.
//!
//! The supervisor never talks to sockets and never spawns anything itself:
//! it watches the store's entity tables and process registry, recomputes
//! what should exist from the full observed snapshot, and issues
//! process-create/remove requests against the registry. The process
//! collaborator does the actual spawning and reports liveness by filling in
//! the pid. Entity-side effects (run-states, pids, handler detachment) go
//! through the [`SupervisorGate`] so the broker's in-memory model stays
//! authoritative.
//!
//! Events may arrive reordered or duplicated; every decision is recomputed
//! from current fact, so a stray notification at worst triggers a no-op
//! pass.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use arbor_core::{EntityId, Pid, RunState, SupervisedKind};
use arbor_store::records::{MarketRecord, SessionRecord};
use arbor_store::{tables, EntityStore, ProcessRecord, RecordId, StoreEvent, StoreResult, TableId};

/// Convenience alias for supervisor results.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] arbor_store::StoreError),
    /// The store connection is gone; the runtime must resynchronize
    /// everything and start a fresh supervisor.
    #[error("store connection lost")]
    StoreLost,
    /// The subscription lagged far enough to drop events; observed state
    /// can no longer be trusted.
    #[error("store subscription lagged")]
    SubscriptionLagged,
}

/// Entity-side effects the supervisor needs from the broker.
pub trait SupervisorGate: Send + Sync {
    /// Write a run-state transition decided by supervision.
    fn set_run_state(&self, user: &str, kind: SupervisedKind, id: EntityId, state: RunState);

    /// Record (or clear) the process id bound to an entity.
    fn set_pid(&self, user: &str, kind: SupervisedKind, id: EntityId, pid: Option<Pid>);

    /// A tracked process vanished without a stop request: force the entity
    /// to stopped and treat its handler connection as disconnected.
    fn handler_vanished(&self, user: &str, kind: SupervisedKind, id: EntityId);
}

/// Key of one supervised entity record in the store.
type Target = (SupervisedKind, RecordId);

#[derive(Clone, Debug)]
struct EntityState {
    user: String,
    entity_id: EntityId,
    run_state: RunState,
    executable: String,
}

impl EntityState {
    fn desired_running(&self) -> bool {
        matches!(self.run_state, RunState::Starting | RunState::Running)
    }
}

#[derive(Clone, Debug)]
struct ProcessState {
    target: Option<Target>,
    pid: Pid,
}

/// The reconciliation loop. One instance per broker process.
pub struct Supervisor {
    store: Arc<dyn EntityStore>,
    gate: Arc<dyn SupervisorGate>,
    markets_table: TableId,
    sessions_table: TableId,
    processes_table: TableId,
    entities: HashMap<Target, EntityState>,
    processes: HashMap<RecordId, ProcessState>,
    by_target: HashMap<Target, RecordId>,
    /// Removal requests awaiting the store's confirmation.
    pending_stops: HashMap<RecordId, Target>,
}

impl Supervisor {
    /// Open the tables and load the full current snapshot.
    pub async fn load(
        store: Arc<dyn EntityStore>,
        gate: Arc<dyn SupervisorGate>,
    ) -> SupervisorResult<Self> {
        let markets_table = store.create_table(tables::MARKETS).await?;
        let sessions_table = store.create_table(tables::SESSIONS).await?;
        let processes_table = store.create_table(tables::PROCESSES).await?;
        let mut supervisor = Self {
            store,
            gate,
            markets_table,
            sessions_table,
            processes_table,
            entities: HashMap::new(),
            processes: HashMap::new(),
            by_target: HashMap::new(),
            pending_stops: HashMap::new(),
        };

        for (record_id, value) in supervisor.store.query(markets_table).await? {
            supervisor.observe_entity(SupervisedKind::Market, record_id, &value);
        }
        for (record_id, value) in supervisor.store.query(sessions_table).await? {
            supervisor.observe_entity(SupervisedKind::Session, record_id, &value);
        }
        for (record_id, value) in supervisor.store.query(processes_table).await? {
            supervisor.observe_process(record_id, &value);
        }
        info!(
            entities = supervisor.entities.len(),
            processes = supervisor.processes.len(),
            "supervisor loaded"
        );
        Ok(supervisor)
    }

    /// Drive reconciliation from the store's subscription stream. Returns
    /// an error when observed state can no longer be trusted; the caller
    /// resynchronizes and starts over.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<StoreEvent>,
    ) -> SupervisorResult<()> {
        self.reconcile().await;
        loop {
            match events.recv().await {
                Ok(event) => self.apply_event(event).await?,
                Err(broadcast::error::RecvError::Closed) => return Err(SupervisorError::StoreLost),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "supervisor subscription lagged");
                    return Err(SupervisorError::SubscriptionLagged);
                }
            }
        }
    }

    /// Fold one store notification into the observed snapshot, then
    /// reconcile.
    pub async fn apply_event(&mut self, event: StoreEvent) -> SupervisorResult<()> {
        match event {
            StoreEvent::RecordAdded { table, id, record }
            | StoreEvent::RecordUpdated { table, id, record } => {
                if table == self.markets_table {
                    self.observe_entity(SupervisedKind::Market, id, &record);
                } else if table == self.sessions_table {
                    self.observe_entity(SupervisedKind::Session, id, &record);
                } else if table == self.processes_table {
                    self.observe_process(id, &record);
                }
            }
            StoreEvent::RecordRemoved { table, id } => {
                if table == self.markets_table {
                    self.forget_entity((SupervisedKind::Market, id)).await;
                } else if table == self.sessions_table {
                    self.forget_entity((SupervisedKind::Session, id)).await;
                } else if table == self.processes_table {
                    self.forget_process(id);
                }
            }
            StoreEvent::TableAdded { .. } => {}
            StoreEvent::Disconnected => return Err(SupervisorError::StoreLost),
        }
        self.reconcile().await;
        Ok(())
    }

    fn observe_entity(&mut self, kind: SupervisedKind, record_id: RecordId, value: &serde_json::Value) {
        let state = match kind {
            SupervisedKind::Market => serde_json::from_value::<MarketRecord>(value.clone())
                .ok()
                .map(|record| EntityState {
                    user: record.user,
                    entity_id: record.market.id,
                    run_state: record.market.run_state,
                    executable: record.executable,
                }),
            SupervisedKind::Session => serde_json::from_value::<SessionRecord>(value.clone())
                .ok()
                .map(|record| EntityState {
                    user: record.user,
                    entity_id: record.session.id,
                    run_state: record.session.run_state,
                    executable: record.executable,
                }),
        };
        match state {
            Some(state) => {
                self.entities.insert((kind, record_id), state);
            }
            None => warn!(?kind, record_id, "skipping malformed entity record"),
        }
    }

    fn observe_process(&mut self, record_id: RecordId, value: &serde_json::Value) {
        let Ok(record) = serde_json::from_value::<ProcessRecord>(value.clone()) else {
            warn!(record_id, "skipping malformed process record");
            return;
        };
        let target = parse_target(&record.command);
        let previous_pid = self
            .processes
            .get(&record_id)
            .map(|process| process.pid)
            .unwrap_or(0);
        if let Some(target) = target {
            self.by_target.insert(target, record_id);
            if record.pid != 0 && record.pid != previous_pid {
                if let Some(entity) = self.entities.get(&target) {
                    debug!(pid = record.pid, entity = entity.entity_id, "process reported live");
                    self.gate.set_pid(
                        &entity.user,
                        target.0,
                        entity.entity_id,
                        Some(record.pid),
                    );
                }
            }
        }
        self.processes.insert(
            record_id,
            ProcessState {
                target,
                pid: record.pid,
            },
        );
    }

    async fn forget_entity(&mut self, target: Target) {
        let Some(_state) = self.entities.remove(&target) else {
            return;
        };
        // The entity is gone; its process has nothing left to serve.
        if let Some(process_id) = self.by_target.get(&target).copied() {
            if !self.pending_stops.contains_key(&process_id) {
                match self.store.remove(self.processes_table, process_id).await {
                    Ok(()) => {
                        self.pending_stops.insert(process_id, target);
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to remove process of deleted entity")
                    }
                }
            }
        }
    }

    fn forget_process(&mut self, record_id: RecordId) {
        let Some(process) = self.processes.remove(&record_id) else {
            return;
        };
        let Some(target) = process.target else {
            self.pending_stops.remove(&record_id);
            return;
        };
        if self.by_target.get(&target) == Some(&record_id) {
            self.by_target.remove(&target);
        }
        let requested = self.pending_stops.remove(&record_id).is_some();
        let Some(entity) = self.entities.get_mut(&target) else {
            return;
        };
        if requested {
            // Confirmed removal of a stop we asked for.
            entity.run_state = RunState::Stopped;
            self.gate
                .set_pid(&entity.user, target.0, entity.entity_id, None);
            self.gate
                .set_run_state(&entity.user, target.0, entity.entity_id, RunState::Stopped);
        } else {
            // The process vanished underneath us.
            warn!(entity = entity.entity_id, "tracked process vanished");
            entity.run_state = RunState::Stopped;
            self.gate
                .handler_vanished(&entity.user, target.0, entity.entity_id);
        }
    }

    /// Recompute every entity's should-be from the observed snapshot and
    /// issue the missing requests. Invoking this twice in a row with no
    /// external change produces no additional store traffic.
    pub async fn reconcile(&mut self) {
        let targets: Vec<Target> = self.entities.keys().copied().collect();
        for target in targets {
            if let Err(err) = self.reconcile_target(target).await {
                warn!(error = %err, "reconciliation step failed; will retry");
            }
        }
    }

    async fn reconcile_target(&mut self, target: Target) -> StoreResult<()> {
        let Some(entity) = self.entities.get(&target).cloned() else {
            return Ok(());
        };
        let attached = self.by_target.get(&target).copied();

        if entity.desired_running() {
            // At most one process per entity: the association is recorded
            // the moment the create request succeeds, so repeated passes
            // cannot request a second one.
            if attached.is_none() {
                if entity.run_state != RunState::Starting {
                    self.set_local_run_state(target, RunState::Starting);
                }
                let command = spawn_command(&entity.executable, target);
                debug!(%command, "requesting process");
                let record = serde_json::to_value(ProcessRecord { command, pid: 0 })
                    .expect("process record serialization");
                let record_id = self.store.add(self.processes_table, record).await?;
                self.processes.insert(
                    record_id,
                    ProcessState {
                        target: Some(target),
                        pid: 0,
                    },
                );
                self.by_target.insert(target, record_id);
            }
            // starting -> running is the router's call, made when the
            // process actually registers as a handler.
        } else if let Some(process_id) = attached {
            if !self.pending_stops.contains_key(&process_id) {
                if entity.run_state != RunState::Stopping {
                    self.set_local_run_state(target, RunState::Stopping);
                }
                self.store.remove(self.processes_table, process_id).await?;
                self.pending_stops.insert(process_id, target);
            }
        } else if entity.run_state == RunState::Stopping {
            // Asked to stop but no process was ever attached.
            self.set_local_run_state(target, RunState::Stopped);
        }
        Ok(())
    }

    fn set_local_run_state(&mut self, target: Target, state: RunState) {
        if let Some(entity) = self.entities.get_mut(&target) {
            entity.run_state = state;
            self.gate
                .set_run_state(&entity.user, target.0, entity.entity_id, state);
        }
    }

    /// Number of process records currently associated; used by tests.
    #[must_use]
    pub fn tracked_processes(&self) -> usize {
        self.processes.len()
    }
}

fn spawn_command(executable: &str, target: Target) -> String {
    let kind = match target.0 {
        SupervisedKind::Market => "market",
        SupervisedKind::Session => "session",
    };
    format!("{executable} {kind}:{}", target.1)
}

fn parse_target(command: &str) -> Option<Target> {
    let arg = command.rsplit(' ').next()?;
    let (kind, record_id) = arg.split_once(':')?;
    let record_id = record_id.parse().ok()?;
    let kind = match kind {
        "market" => SupervisedKind::Market,
        "session" => SupervisedKind::Session,
        _ => return None,
    };
    Some((kind, record_id))
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use serde_json::json;

    use arbor_core::{Market, Session};
    use arbor_store::MemoryStore;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum GateCall {
        RunState(String, SupervisedKind, EntityId, RunState),
        Pid(String, SupervisedKind, EntityId, Option<Pid>),
        Vanished(String, SupervisedKind, EntityId),
    }

    #[derive(Default)]
    struct RecordingGate {
        calls: Mutex<Vec<GateCall>>,
    }

    impl SupervisorGate for RecordingGate {
        fn set_run_state(&self, user: &str, kind: SupervisedKind, id: EntityId, state: RunState) {
            self.calls
                .lock()
                .push(GateCall::RunState(user.into(), kind, id, state));
        }

        fn set_pid(&self, user: &str, kind: SupervisedKind, id: EntityId, pid: Option<Pid>) {
            self.calls.lock().push(GateCall::Pid(user.into(), kind, id, pid));
        }

        fn handler_vanished(&self, user: &str, kind: SupervisedKind, id: EntityId) {
            self.calls
                .lock()
                .push(GateCall::Vanished(user.into(), kind, id));
        }
    }

    fn market_record(run_state: RunState) -> serde_json::Value {
        let mut market = Market::new(1, 1, "trader", "key", "secret");
        market.run_state = run_state;
        serde_json::to_value(MarketRecord {
            user: "kay".into(),
            executable: "markets/paper".into(),
            market,
        })
        .unwrap()
    }

    fn session_record(run_state: RunState) -> serde_json::Value {
        let mut session = Session::new(2, "flip", 1, 1, Decimal::new(100, 0), Decimal::ZERO);
        session.run_state = run_state;
        serde_json::to_value(SessionRecord {
            user: "kay".into(),
            executable: "bots/flip".into(),
            session,
        })
        .unwrap()
    }

    async fn setup(
        seed: Vec<(&str, serde_json::Value)>,
    ) -> (Supervisor, Arc<RecordingGate>, MemoryStore) {
        let store = MemoryStore::new();
        for (table, record) in seed {
            let table = store.create_table(table).await.unwrap();
            store.add(table, record).await.unwrap();
        }
        let gate = Arc::new(RecordingGate::default());
        let supervisor = Supervisor::load(
            Arc::new(store.clone()),
            Arc::clone(&gate) as Arc<dyn SupervisorGate>,
        )
        .await
        .unwrap();
        (supervisor, gate, store)
    }

    async fn process_count(store: &MemoryStore) -> usize {
        let table = store.create_table(tables::PROCESSES).await.unwrap();
        store.query(table).await.unwrap().len()
    }

    #[tokio::test]
    async fn desired_running_spawns_exactly_one_process() {
        let (mut supervisor, gate, store) =
            setup(vec![(tables::MARKETS, market_record(RunState::Starting))]).await;

        supervisor.reconcile().await;
        assert_eq!(process_count(&store).await, 1);

        // Idempotent: a second pass with no external change is a no-op.
        supervisor.reconcile().await;
        supervisor.reconcile().await;
        assert_eq!(process_count(&store).await, 1);

        let calls = gate.calls.lock();
        assert!(calls
            .iter()
            .all(|call| !matches!(call, GateCall::Vanished(..))));
    }

    #[tokio::test]
    async fn stopped_desire_keeps_everything_quiet() {
        let (mut supervisor, _gate, store) =
            setup(vec![(tables::MARKETS, market_record(RunState::Stopped))]).await;
        supervisor.reconcile().await;
        assert_eq!(process_count(&store).await, 0);
    }

    #[tokio::test]
    async fn observed_pid_is_forwarded_through_the_gate() {
        let (mut supervisor, gate, store) =
            setup(vec![(tables::SESSIONS, session_record(RunState::Starting))]).await;
        supervisor.reconcile().await;

        // The process collaborator spawns the command and reports liveness.
        let processes = store.create_table(tables::PROCESSES).await.unwrap();
        let (record_id, value) = store.query(processes).await.unwrap().pop().unwrap();
        let mut record: ProcessRecord = serde_json::from_value(value).unwrap();
        record.pid = 4711;
        let updated = serde_json::to_value(&record).unwrap();
        store.update(processes, record_id, updated.clone()).await.unwrap();

        supervisor
            .apply_event(StoreEvent::RecordUpdated {
                table: processes,
                id: record_id,
                record: updated,
            })
            .await
            .unwrap();

        assert!(gate.calls.lock().contains(&GateCall::Pid(
            "kay".into(),
            SupervisedKind::Session,
            2,
            Some(4711)
        )));
    }

    #[tokio::test]
    async fn stop_request_removes_process_and_confirms_stopped() {
        let (mut supervisor, gate, store) =
            setup(vec![(tables::MARKETS, market_record(RunState::Starting))]).await;
        supervisor.reconcile().await;
        let processes = store.create_table(tables::PROCESSES).await.unwrap();
        let markets = store.create_table(tables::MARKETS).await.unwrap();
        let (process_id, _) = store.query(processes).await.unwrap().pop().unwrap();

        // Owner asks for a stop: the broker writes the entity as stopping.
        supervisor
            .apply_event(StoreEvent::RecordUpdated {
                table: markets,
                id: 1,
                record: market_record(RunState::Stopping),
            })
            .await
            .unwrap();
        assert_eq!(process_count(&store).await, 0, "process removal requested");

        // The store confirms the removal.
        supervisor
            .apply_event(StoreEvent::RecordRemoved {
                table: processes,
                id: process_id,
            })
            .await
            .unwrap();

        let calls = gate.calls.lock();
        assert!(calls.contains(&GateCall::RunState(
            "kay".into(),
            SupervisedKind::Market,
            1,
            RunState::Stopped
        )));
        assert!(calls.contains(&GateCall::Pid(
            "kay".into(),
            SupervisedKind::Market,
            1,
            None
        )));
        assert!(!calls.iter().any(|call| matches!(call, GateCall::Vanished(..))));
    }

    #[tokio::test]
    async fn vanished_process_forces_stop_and_detaches_handler() {
        let (mut supervisor, gate, store) =
            setup(vec![(tables::MARKETS, market_record(RunState::Starting))]).await;
        supervisor.reconcile().await;
        let processes = store.create_table(tables::PROCESSES).await.unwrap();
        let (process_id, _) = store.query(processes).await.unwrap().pop().unwrap();

        // No stop request: the record disappears on its own.
        store.remove(processes, process_id).await.unwrap();
        supervisor
            .apply_event(StoreEvent::RecordRemoved {
                table: processes,
                id: process_id,
            })
            .await
            .unwrap();

        assert!(gate.calls.lock().contains(&GateCall::Vanished(
            "kay".into(),
            SupervisedKind::Market,
            1
        )));
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let (mut supervisor, _gate, store) =
            setup(vec![(tables::MARKETS, json!({"not": "a market"}))]).await;
        supervisor.reconcile().await;
        assert_eq!(process_count(&store).await, 0);
    }

    #[test]
    fn spawn_command_round_trips_through_parse() {
        let command = spawn_command("markets/paper", (SupervisedKind::Market, 12));
        assert_eq!(command, "markets/paper market:12");
        assert_eq!(parse_target(&command), Some((SupervisedKind::Market, 12)));
        assert_eq!(parse_target("markets/paper"), None);
        assert_eq!(parse_target("bots/flip weird:x"), None);
    }
}
