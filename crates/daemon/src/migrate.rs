//! Migration chains for butler schemas.
//!
//! Every chain creates the core per-butler tables (state, secrets, route
//! inbox, sessions, scheduled tasks); butlers with extra concerns layer
//! their own tables on top. Privilege grants are applied best-effort after
//! the DDL so a missing runtime role never fails a migration run.

use sqlx::PgPool;
use tracing::info;

use butlers_delivery::PostgresDeliveryStore;
use butlers_inbox::PostgresRouteInbox;
use butlers_registry::{PostgresRegistry, PostgresRoutingLog};
use butlers_scheduler::PostgresScheduleStore;
use butlers_spawner::PostgresSessionStore;
use butlers_state_postgres::{PostgresConfig, acl};

use crate::daemon::DaemonError;
use crate::mailbox::PostgresMailbox;
use crate::switchboard::migrate_switchboard_tables;

/// The fleet's schemas, used when revoking cross-schema access.
pub const KNOWN_SCHEMAS: &[&str] = &[
    "general",
    "health",
    "messenger",
    "relationship",
    "switchboard",
    "memory",
    "home",
];

/// Apply the migration chain for one butler schema against `url`.
pub async fn migrate_chain(url: &str, chain: &str) -> Result<(), DaemonError> {
    let config = PostgresConfig::new(url, chain);
    // `connect` creates the schema plus the state and secrets tables.
    let pool = config.connect().await?;

    migrate_core_tables(&pool, chain).await?;
    match chain {
        "messenger" => {
            PostgresDeliveryStore::new(pool.clone(), chain)
                .await
                .map_err(|e| DaemonError::Store(e.to_string()))?;
            info!(chain, "applied delivery tables");
        }
        "switchboard" => {
            PostgresRegistry::new(pool.clone(), chain)
                .await
                .map_err(|e| DaemonError::Store(e.to_string()))?;
            PostgresRoutingLog::new(pool.clone(), chain)
                .await
                .map_err(|e| DaemonError::Store(e.to_string()))?;
            migrate_switchboard_tables(&pool, chain).await?;
            info!(chain, "applied switchboard tables");
        }
        _ => {}
    }

    acl::apply_schema_acl(&pool, chain, KNOWN_SCHEMAS).await;
    info!(chain, "migration chain applied");
    Ok(())
}

/// Core tables every butler owns.
async fn migrate_core_tables(pool: &PgPool, schema: &str) -> Result<(), DaemonError> {
    PostgresRouteInbox::new(pool.clone(), schema).await?;
    PostgresSessionStore::new(pool.clone(), schema).await?;
    PostgresScheduleStore::new(pool.clone(), schema).await?;
    PostgresMailbox::new(pool.clone(), schema).await?;
    Ok(())
}
