use anyhow::Context;

use butlers_daemon::migrate::{KNOWN_SCHEMAS, migrate_chain};

/// `butlers migrate` -- apply the migration chain for one butler schema.
pub async fn run(chain: &str, url: &str) -> anyhow::Result<()> {
    if !KNOWN_SCHEMAS.contains(&chain) {
        anyhow::bail!(
            "unknown migration chain '{chain}' (known: {})",
            KNOWN_SCHEMAS.join(", ")
        );
    }
    migrate_chain(url, chain)
        .await
        .with_context(|| format!("migration chain '{chain}' failed"))?;
    println!("applied migration chain '{chain}'");
    Ok(())
}
