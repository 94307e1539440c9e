use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use rmcp::{ServiceExt, transport::stdio};
use tracing::info;

use butlers_daemon::{ButlerConfig, ButlerDaemon, ButlerMcpServer, telemetry};

/// How long a stopping daemon waits for in-flight sessions.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// `butlers run` -- start one daemon in-process and serve its MCP tools over
/// stdio until the client disconnects.
pub async fn run(config_dir: &Path) -> anyhow::Result<()> {
    let config = ButlerConfig::load(config_dir)
        .with_context(|| format!("failed to load config from {}", config_dir.display()))?;

    // Logs go to stderr; stdout belongs to the MCP transport.
    let guard = telemetry::init(&config.telemetry);

    let name = config.name.clone();
    info!(butler = %name, "starting butler daemon");
    let daemon = ButlerDaemon::start(config)
        .await
        .with_context(|| format!("failed to start butler '{name}'"))?;

    let service = ButlerMcpServer::new(daemon.clone())
        .serve(stdio())
        .await
        .context("failed to serve MCP over stdio")?;
    service.waiting().await.context("MCP service failed")?;

    daemon.stop(DRAIN_TIMEOUT).await;
    guard.shutdown();
    Ok(())
}
