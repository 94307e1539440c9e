use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use butlers_contracts::{ContractError, RouteEnvelope, parse_route};
use butlers_inbox::{
    DEFAULT_RECOVERY_BATCH, DEFAULT_RECOVERY_GRACE_SECONDS, InboxError, MemoryRouteInbox,
    PostgresRouteInbox, RouteInboxStore, recovery_sweep,
};
use butlers_scheduler::{
    MemoryScheduleStore, PostgresScheduleStore, ScheduleError, Scheduler, TaskInvocation,
};
use butlers_spawner::{
    MemorySessionStore, PostgresSessionStore, SessionStore, Spawner, SpawnerConfig, SpawnerError,
    TriggerOptions, create_adapter,
};
use butlers_delivery::{DeliveryStore, MemoryDeliveryStore, PostgresDeliveryStore};
use butlers_state::{SecretStore, StateStore};
use butlers_state_memory::{MemorySecretStore, MemoryStateStore};
use butlers_state_postgres::{PostgresConfig, PostgresSecretStore, PostgresStateStore};

use crate::config::{ButlerConfig, ConfigError};
use crate::mailbox::{MailboxStore, MemoryMailbox, PostgresMailbox};
use crate::modules::{ModuleDef, ModuleRegistry, ModuleRegistryError};

/// How often the scheduler loop ticks.
const SCHEDULER_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from daemon assembly and operation.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Modules(#[from] ModuleRegistryError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Spawner(#[from] SpawnerError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("state store error: {0}")]
    State(#[from] butlers_state::StateError),

    #[error("store error: {0}")]
    Store(String),
}

/// One running butler daemon.
///
/// Owns the per-butler stores and background loops. The MCP layer
/// ([`ButlerMcpServer`](crate::ButlerMcpServer)) is a thin shim over the
/// methods here.
pub struct ButlerDaemon {
    config: ButlerConfig,
    modules: Vec<ModuleDef>,
    state: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    inbox: Arc<dyn RouteInboxStore>,
    sessions: Arc<dyn SessionStore>,
    spawner: Arc<Spawner>,
    scheduler: Arc<Scheduler>,
    mailbox: Option<Arc<dyn MailboxStore>>,
    delivery: Option<Arc<dyn DeliveryStore>>,
    pool: Option<sqlx::PgPool>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ButlerDaemon {
    /// Assemble and start a daemon: stores, spawner, schedule sync, startup
    /// recovery sweep, and the scheduler loop.
    pub async fn start(config: ButlerConfig) -> Result<Arc<Self>, DaemonError> {
        let modules = ModuleRegistry::builtin().resolve(&config.modules)?;
        info!(
            butler = %config.name,
            modules = ?modules.iter().map(|m| m.name).collect::<Vec<_>>(),
            "resolved module initialization order"
        );

        let schema = config.schema().to_owned();
        let (state, secrets, inbox, sessions, mailbox, pool): (
            Arc<dyn StateStore>,
            Arc<dyn SecretStore>,
            Arc<dyn RouteInboxStore>,
            Arc<dyn SessionStore>,
            Option<Arc<dyn MailboxStore>>,
            Option<sqlx::PgPool>,
        ) = match config.db.dsn.as_deref() {
            Some(dsn) => {
                let pg = PostgresConfig::new(dsn, &schema);
                let pool = pg.connect().await?;
                let mailbox: Option<Arc<dyn MailboxStore>> = if config.has_module("mailbox") {
                    Some(Arc::new(PostgresMailbox::new(pool.clone(), &schema).await?))
                } else {
                    None
                };
                (
                    Arc::new(PostgresStateStore::from_pool(pool.clone(), pg.clone()).await?),
                    Arc::new(PostgresSecretStore::from_pool(pool.clone(), pg).await?),
                    Arc::new(PostgresRouteInbox::new(pool.clone(), &schema).await?),
                    Arc::new(PostgresSessionStore::new(pool.clone(), &schema).await?),
                    mailbox,
                    Some(pool),
                )
            }
            None => {
                warn!(butler = %config.name, "no DSN configured; using in-memory stores");
                let mailbox: Option<Arc<dyn MailboxStore>> = config
                    .has_module("mailbox")
                    .then(|| Arc::new(MemoryMailbox::new()) as Arc<dyn MailboxStore>);
                (
                    Arc::new(MemoryStateStore::new()),
                    Arc::new(MemorySecretStore::new()),
                    Arc::new(MemoryRouteInbox::new()),
                    Arc::new(MemorySessionStore::new()),
                    mailbox,
                    None,
                )
            }
        };

        let adapter = create_adapter(&config.runtime.adapter)?;
        let spawner = Arc::new(Spawner::new(
            adapter,
            Some(Arc::clone(&sessions)),
            SpawnerConfig {
                max_concurrent_sessions: config.runtime.max_concurrent_sessions,
                model: config.runtime.model.clone(),
                timeout: config.runtime.timeout_seconds.map(Duration::from_secs),
            },
        ));

        let schedule_store: Arc<dyn butlers_scheduler::ScheduleStore> = match &pool {
            Some(pool) => Arc::new(PostgresScheduleStore::new(pool.clone(), &schema).await?),
            None => Arc::new(MemoryScheduleStore::new()),
        };
        let scheduler = Arc::new(Scheduler::new(schedule_store));
        scheduler.sync_schedules(&config.schedules).await?;

        let delivery: Option<Arc<dyn DeliveryStore>> = if config.has_module("delivery") {
            match &pool {
                Some(pool) => Some(Arc::new(
                    PostgresDeliveryStore::new(pool.clone(), &schema)
                        .await
                        .map_err(|e| DaemonError::Store(e.to_string()))?,
                )),
                None => Some(Arc::new(MemoryDeliveryStore::new())),
            }
        } else {
            None
        };

        let daemon = Arc::new(Self {
            config,
            modules,
            state,
            secrets,
            inbox,
            sessions,
            spawner,
            scheduler,
            mailbox,
            delivery,
            pool,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        daemon.run_recovery_sweep().await?;
        daemon.spawn_scheduler_loop();

        info!(butler = %daemon.config.name, "butler daemon started");
        Ok(daemon)
    }

    /// The daemon's configuration.
    #[must_use]
    pub fn config(&self) -> &ButlerConfig {
        &self.config
    }

    /// Modules in initialization order.
    #[must_use]
    pub fn modules(&self) -> &[ModuleDef] {
        &self.modules
    }

    /// The per-butler state KV.
    #[must_use]
    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// The per-butler credential store.
    #[must_use]
    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// The session store (liveness view).
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// The route inbox.
    #[must_use]
    pub fn inbox(&self) -> &Arc<dyn RouteInboxStore> {
        &self.inbox
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The mailbox, when the module is enabled.
    #[must_use]
    pub fn mailbox(&self) -> Option<&Arc<dyn MailboxStore>> {
        self.mailbox.as_ref()
    }

    /// The delivery store, when the `delivery` module is enabled (the
    /// messenger butler).
    #[must_use]
    pub fn delivery(&self) -> Option<&Arc<dyn DeliveryStore>> {
        self.delivery.as_ref()
    }

    /// The session spawner.
    #[must_use]
    pub fn spawner(&self) -> &Arc<Spawner> {
        &self.spawner
    }

    /// The shared connection pool, when running on Postgres.
    #[must_use]
    pub fn pool(&self) -> Option<&sqlx::PgPool> {
        self.pool.as_ref()
    }

    /// Accept a `route.v1` envelope into the inbox and dispatch it in the
    /// background. Returns the inbox row id.
    pub async fn route_execute(&self, payload: &Value) -> Result<Uuid, DaemonError> {
        let envelope = parse_route(payload)?;
        let row_id = self.inbox.insert(&envelope).await?;
        info!(row_id = %row_id, "accepted route envelope");

        self.spawn_dispatch(row_id, envelope);
        Ok(row_id)
    }

    /// Dispatch one inbox row in a background task.
    fn spawn_dispatch(&self, row_id: Uuid, envelope: RouteEnvelope) {
        let inbox = Arc::clone(&self.inbox);
        let spawner = Arc::clone(&self.spawner);
        self.tracker.spawn(async move {
            match inbox.mark_processing(row_id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Another worker (or the recovery sweep) owns this row.
                    return;
                }
                Err(e) => {
                    error!(row_id = %row_id, error = %e, "failed to claim inbox row");
                    return;
                }
            }
            dispatch_envelope(inbox.as_ref(), spawner.as_ref(), row_id, &envelope).await;
        });
    }

    /// Run the startup recovery sweep: re-dispatch rows stuck from a crash.
    async fn run_recovery_sweep(self: &Arc<Self>) -> Result<u32, DaemonError> {
        let spawner = Arc::clone(&self.spawner);
        let inbox = Arc::clone(&self.inbox);
        let swept = recovery_sweep(
            self.inbox.as_ref(),
            |row_id, envelope| {
                let spawner = Arc::clone(&spawner);
                let inbox = Arc::clone(&inbox);
                async move {
                    dispatch_envelope(inbox.as_ref(), spawner.as_ref(), row_id, &envelope).await;
                    Ok(())
                }
            },
            Duration::from_secs(DEFAULT_RECOVERY_GRACE_SECONDS),
            DEFAULT_RECOVERY_BATCH,
        )
        .await?;
        if swept > 0 {
            info!(swept, "startup recovery sweep dispatched stuck rows");
        }
        Ok(swept)
    }

    /// Advance the scheduler once, dispatching due tasks into the spawner.
    pub async fn tick(&self) -> Result<u32, DaemonError> {
        let spawner = Arc::clone(&self.spawner);
        let dispatched = self
            .scheduler
            .tick(move |invocation, trigger_source| {
                let spawner = Arc::clone(&spawner);
                async move {
                    let prompt = match invocation {
                        TaskInvocation::Prompt(prompt) => prompt,
                        TaskInvocation::Job { name, args } => {
                            // Background jobs ride the same spawner path with
                            // a synthesized prompt.
                            format!("Run the `{name}` job with arguments: {args}")
                        }
                    };
                    let result = spawner
                        .trigger(&prompt, &trigger_source, TriggerOptions::default())
                        .await
                        .map_err(|e| e.to_string())?;
                    serde_json::to_value(SpawnSummary::from(&result)).map_err(|e| e.to_string())
                }
            })
            .await?;
        Ok(dispatched)
    }

    fn spawn_scheduler_loop(self: &Arc<Self>) {
        let daemon = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(SCHEDULER_TICK_INTERVAL) => {}
                    () = daemon.shutdown.cancelled() => return,
                }
                if let Err(e) = daemon.tick().await {
                    // A failing tick must not stop the loop.
                    error!(error = %e, "scheduler tick failed");
                }
            }
        });
    }

    /// Graceful shutdown: stop the loops, then drain the spawner.
    pub async fn stop(&self, drain_timeout: Duration) {
        info!(butler = %self.config.name, "stopping butler daemon");
        self.shutdown.cancel();
        self.spawner.stop_accepting();
        self.tracker.close();
        let _ = tokio::time::timeout(drain_timeout, self.tracker.wait()).await;
        self.spawner.drain(drain_timeout).await;
        info!(butler = %self.config.name, "butler daemon stopped");
    }
}

/// Serializable summary of a spawner result, stored in `last_result`.
#[derive(Debug, serde::Serialize)]
struct SpawnSummary {
    session_id: Option<Uuid>,
    success: bool,
    error: Option<String>,
    duration_ms: u64,
    tool_calls: usize,
}

impl From<&butlers_spawner::SpawnerResult> for SpawnSummary {
    fn from(result: &butlers_spawner::SpawnerResult) -> Self {
        Self {
            session_id: result.session_id,
            success: result.success,
            error: result.error.clone(),
            duration_ms: result.duration_ms,
            tool_calls: result.tool_call_count,
        }
    }
}

/// Execute one claimed inbox row through the spawner and record the terminal
/// state. The row must already be in `processing`.
async fn dispatch_envelope(
    inbox: &dyn RouteInboxStore,
    spawner: &Spawner,
    row_id: Uuid,
    envelope: &RouteEnvelope,
) {
    let context = envelope.input.context.as_ref().map(|c| match c {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let options = TriggerOptions {
        request_id: Some(envelope.request_context.request_id.as_uuid()),
        context,
        ..TriggerOptions::default()
    };

    match spawner
        .trigger(envelope.input.prompt.as_str(), "route.execute", options)
        .await
    {
        Ok(result) if result.success => {
            if let Err(e) = inbox.mark_processed(row_id, result.session_id).await {
                error!(row_id = %row_id, error = %e, "failed to mark row processed");
            }
        }
        Ok(result) => {
            let detail = result.error.unwrap_or_else(|| "unknown failure".into());
            if let Err(e) = inbox.mark_errored(row_id, &detail).await {
                error!(row_id = %row_id, error = %e, "failed to mark row errored");
            }
        }
        Err(e) => {
            // Spawner refused (draining): leave the row in processing so a
            // later recovery sweep picks it up.
            warn!(row_id = %row_id, error = %e, "dispatch deferred");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_inbox::LifecycleState;
    use serde_json::json;

    fn memory_config(modules: &[&str]) -> ButlerConfig {
        ButlerConfig::from_toml(&format!(
            "[butler]\nname = \"health\"\nmodules = [{}]\n\n[butler.runtime]\nadapter = \"mock\"\n",
            modules
                .iter()
                .map(|m| format!("\"{m}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .unwrap()
    }

    fn route_payload() -> Value {
        json!({
            "schema_version": "route.v1",
            "request_context": {
                "request_id": Uuid::now_v7().to_string(),
                "received_at": "2026-02-18T10:00:00Z",
                "source_channel": "telegram",
                "source_endpoint_identity": "switchboard",
                "source_sender_identity": "user-7"
            },
            "input": {"prompt": "Summarize my day."}
        })
    }

    #[tokio::test]
    async fn route_execute_accepts_and_processes() {
        let daemon = ButlerDaemon::start(memory_config(&["mailbox"])).await.unwrap();
        let row_id = daemon.route_execute(&route_payload()).await.unwrap();

        // Give the background dispatch a moment.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let row = daemon.inbox().fetch(row_id).await.unwrap().unwrap();
            if row.lifecycle_state == LifecycleState::Processed {
                assert!(row.session_id.is_some());
                return;
            }
        }
        panic!("row never reached processed");
    }

    #[tokio::test]
    async fn route_execute_rejects_bad_envelopes() {
        let daemon = ButlerDaemon::start(memory_config(&[])).await.unwrap();
        let err = daemon
            .route_execute(&json!({"schema_version": "route.v2"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Contract(_)));
    }

    #[tokio::test]
    async fn tick_runs_due_schedules_through_the_spawner() {
        let daemon = ButlerDaemon::start(memory_config(&[])).await.unwrap();
        let id = daemon
            .scheduler()
            .create("checkin", "0 9 * * *", "How am I doing?")
            .await
            .unwrap();
        // Force the task due.
        let mut task = daemon.scheduler().store().get(id).await.unwrap().unwrap();
        task.next_run_at = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
        daemon.scheduler().store().save(&task).await.unwrap();

        let dispatched = daemon.tick().await.unwrap();
        assert_eq!(dispatched, 1);

        let task = daemon.scheduler().store().get(id).await.unwrap().unwrap();
        let last_result = task.last_result.unwrap();
        assert_eq!(last_result["success"], json!(true));
        assert!(last_result["session_id"].is_string());
    }

    #[tokio::test]
    async fn duplicate_tick_with_nothing_due_is_quiet() {
        let daemon = ButlerDaemon::start(memory_config(&[])).await.unwrap();
        daemon
            .scheduler()
            .create("later", "0 9 * * *", "not yet")
            .await
            .unwrap();
        assert_eq!(daemon.tick().await.unwrap(), 0);
        assert_eq!(daemon.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_is_clean() {
        let daemon = ButlerDaemon::start(memory_config(&[])).await.unwrap();
        daemon.stop(Duration::from_secs(1)).await;
    }
}
