//! Runtime wiring: store, broker, supervisor and the metrics sampler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use arbor_broker::{BrokerShared, Server};
use arbor_config::AppConfig;
use arbor_core::{EntityId, Pid, RunState, SupervisedKind, User};
use arbor_store::{EntityStore, MemoryStore};
use arbor_supervisor::{Supervisor, SupervisorError, SupervisorGate};

use crate::telemetry::{spawn_metrics_server, BrokerMetrics};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Bridges supervision decisions into the broker's authoritative model.
/// The gate is synchronous; persistence runs on its own task.
struct BrokerGate {
    shared: Arc<BrokerShared>,
}

impl SupervisorGate for BrokerGate {
    fn set_run_state(&self, user: &str, kind: SupervisedKind, id: EntityId, state: RunState) {
        let shared = Arc::clone(&self.shared);
        let user = user.to_string();
        tokio::spawn(async move {
            shared.apply_run_state(&user, kind, id, state).await;
        });
    }

    fn set_pid(&self, user: &str, kind: SupervisedKind, id: EntityId, pid: Option<Pid>) {
        let shared = Arc::clone(&self.shared);
        let user = user.to_string();
        tokio::spawn(async move {
            shared.apply_process_pid(&user, kind, id, pid).await;
        });
    }

    fn handler_vanished(&self, user: &str, kind: SupervisedKind, id: EntityId) {
        let shared = Arc::clone(&self.shared);
        let user = user.to_string();
        tokio::spawn(async move {
            shared.process_vanished(&user, kind, id).await;
        });
    }
}

/// Build every component and serve until ctrl-c.
///
/// The store here is the embedded in-memory implementation; a remote store
/// client plugs in behind the same [`EntityStore`] trait without touching
/// anything else in this function.
pub async fn run(config: AppConfig) -> Result<()> {
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    serve(config, store).await
}

/// Serve against an explicit store; split out so tests can drive it.
pub async fn serve(config: AppConfig, store: Arc<dyn EntityStore>) -> Result<()> {
    let proxy_timeout = Duration::from_secs(config.proxy_timeout_secs);
    let shared = BrokerShared::connect(Arc::clone(&store), proxy_timeout)
        .await
        .context("failed to open store tables")?;

    shared.seed_catalog(
        config
            .engines
            .iter()
            .map(|engine| (engine.name.clone(), engine.executable.clone())),
        config.adapters.iter().map(|adapter| {
            (
                adapter.name.clone(),
                adapter.executable.clone(),
                adapter.currency_base.clone(),
                adapter.currency_comm.clone(),
            )
        }),
    );
    for user in &config.users {
        shared
            .provision_user(User::new(
                user.name.clone(),
                user.key_bytes()?,
                user.secret_bytes()?,
            ))
            .await
            .with_context(|| format!("failed to provision user '{}'", user.name))?;
    }

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen_addr))?;
    let server = Server::bind(listen_addr, Arc::clone(&shared)).await?;
    let server_task = tokio::spawn(server.run());

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", config.metrics_addr))?;
    let metrics = Arc::new(BrokerMetrics::new());
    let _metrics_server = spawn_metrics_server(metrics.registry(), metrics_addr);
    let _metrics_sampler = spawn_metrics_sampler(Arc::clone(&metrics), Arc::clone(&shared));

    let supervision = spawn_supervision(Arc::clone(&store), Arc::clone(&shared));

    info!(%listen_addr, %metrics_addr, "arbor broker up");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    supervision.abort();
    server_task.abort();
    Ok(())
}

/// Run the supervisor, restarting it through a full resynchronization
/// whenever observed state can no longer be trusted. Everything short of
/// losing the store is retried; incremental repair is never attempted.
fn spawn_supervision(store: Arc<dyn EntityStore>, shared: Arc<BrokerShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let gate: Arc<dyn SupervisorGate> = Arc::new(BrokerGate {
                shared: Arc::clone(&shared),
            });
            let events = store.subscribe();
            let supervisor = match Supervisor::load(Arc::clone(&store), gate).await {
                Ok(supervisor) => supervisor,
                Err(err) => {
                    error!(error = %err, "supervisor failed to load; retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            match supervisor.run(events).await {
                Ok(()) => return,
                Err(SupervisorError::StoreLost) | Err(SupervisorError::SubscriptionLagged) => {
                    warn!("observed state stale; reloading every table from scratch");
                    if let Err(err) = shared.resynchronize().await {
                        error!(error = %err, "resynchronization failed");
                    }
                }
                Err(err) => {
                    error!(error = %err, "supervisor stopped; restarting");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}

fn spawn_metrics_sampler(metrics: Arc<BrokerMetrics>, shared: Arc<BrokerShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            metrics.set_connections(shared.registry.len());
        }
    })
}
