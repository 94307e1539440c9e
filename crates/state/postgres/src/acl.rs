//! Runtime-role privilege application for butler schemas.
//!
//! Each butler connects as `butler_<schema>_rw`, which owns full DML on its
//! own schema, read-only access to `shared`, and nothing anywhere else.
//! Default privileges mirror the grants so future objects inherit the same
//! policy.
//!
//! Every statement here is best-effort: a missing role or insufficient
//! privilege is logged and skipped, never fatal. Privilege drift is repaired
//! on the next `butlers migrate` run.

use sqlx::PgPool;
use tracing::{debug, warn};

/// The schema holding cross-butler tables (contacts, shared secrets).
pub const SHARED_SCHEMA: &str = "shared";

/// Runtime role name for a butler schema.
#[must_use]
pub fn runtime_role(schema: &str) -> String {
    format!("butler_{schema}_rw")
}

/// Execute one grant/revoke statement, downgrading failures to a warning.
async fn apply(pool: &PgPool, statement: &str) {
    match sqlx::query(statement).execute(pool).await {
        Ok(_) => debug!(statement, "applied privilege statement"),
        Err(e) => warn!(statement, error = %e, "skipping privilege statement"),
    }
}

/// Apply the standard privilege set for one butler schema.
///
/// `other_schemas` is the rest of the fleet; the role's access to those is
/// revoked explicitly.
pub async fn apply_schema_acl(pool: &PgPool, schema: &str, other_schemas: &[&str]) {
    let role = runtime_role(schema);

    // Own schema: full DML plus the ability to create objects.
    apply(pool, &format!("GRANT USAGE, CREATE ON SCHEMA {schema} TO {role}")).await;
    apply(
        pool,
        &format!(
            "GRANT SELECT, INSERT, UPDATE, DELETE, TRIGGER, REFERENCES \
             ON ALL TABLES IN SCHEMA {schema} TO {role}"
        ),
    )
    .await;
    apply(
        pool,
        &format!("GRANT USAGE, SELECT, UPDATE ON ALL SEQUENCES IN SCHEMA {schema} TO {role}"),
    )
    .await;
    apply(
        pool,
        &format!("GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {schema} TO {role}"),
    )
    .await;
    apply(
        pool,
        &format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} \
             GRANT SELECT, INSERT, UPDATE, DELETE, TRIGGER, REFERENCES ON TABLES TO {role}"
        ),
    )
    .await;
    apply(
        pool,
        &format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {schema} \
             GRANT USAGE, SELECT, UPDATE ON SEQUENCES TO {role}"
        ),
    )
    .await;

    // Shared schema: read-only, and explicitly no CREATE.
    apply(
        pool,
        &format!("GRANT USAGE ON SCHEMA {SHARED_SCHEMA} TO {role}"),
    )
    .await;
    apply(
        pool,
        &format!("GRANT SELECT ON ALL TABLES IN SCHEMA {SHARED_SCHEMA} TO {role}"),
    )
    .await;
    apply(
        pool,
        &format!("GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {SHARED_SCHEMA} TO {role}"),
    )
    .await;
    apply(
        pool,
        &format!(
            "ALTER DEFAULT PRIVILEGES IN SCHEMA {SHARED_SCHEMA} GRANT SELECT ON TABLES TO {role}"
        ),
    )
    .await;
    apply(
        pool,
        &format!("REVOKE CREATE ON SCHEMA {SHARED_SCHEMA} FROM {role}"),
    )
    .await;

    // Everything else: revoked.
    for other in other_schemas {
        if *other == schema {
            continue;
        }
        apply(
            pool,
            &format!("REVOKE ALL ON ALL TABLES IN SCHEMA {other} FROM {role}"),
        )
        .await;
        apply(pool, &format!("REVOKE ALL ON SCHEMA {other} FROM {role}")).await;
    }
}

/// Revoke the blanket PUBLIC grants on the database and butler schemas.
pub async fn revoke_public(pool: &PgPool, database: &str, schemas: &[&str]) {
    apply(
        pool,
        &format!("REVOKE ALL ON DATABASE {database} FROM PUBLIC"),
    )
    .await;
    apply(pool, "REVOKE ALL ON SCHEMA public FROM PUBLIC").await;
    for schema in schemas {
        apply(pool, &format!("REVOKE ALL ON SCHEMA {schema} FROM PUBLIC")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_follow_schema() {
        assert_eq!(runtime_role("health"), "butler_health_rw");
        assert_eq!(runtime_role("switchboard"), "butler_switchboard_rw");
    }
}
