use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, bail};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use super::discover_roster;

/// `butlers up` -- start daemons for all (or selected) butlers as child
/// processes of this binary, then supervise until interrupted.
pub async fn run(dir: &Path, only: Option<&str>) -> anyhow::Result<()> {
    let selected: Option<Vec<&str>> =
        only.map(|names| names.split(',').map(str::trim).collect());

    let butlers: Vec<_> = discover_roster(dir)?
        .into_iter()
        .filter(|(_, config)| {
            selected
                .as_ref()
                .is_none_or(|names| names.contains(&config.name.as_str()))
        })
        .collect();
    if butlers.is_empty() {
        bail!("no matching butlers to start in {}", dir.display());
    }

    let self_exe = std::env::current_exe().context("failed to resolve own executable")?;
    let mut children: Vec<(String, Child)> = Vec::new();
    for (path, config) in &butlers {
        let child = Command::new(&self_exe)
            .arg("run")
            .arg("--config")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start daemon for '{}'", config.name))?;
        info!(butler = %config.name, pid = child.id(), "started daemon");
        children.push((config.name.clone(), child));
    }

    println!("started {} butler daemon(s); ctrl-c to stop", children.len());
    tokio::signal::ctrl_c().await.context("signal handler failed")?;

    for (name, mut child) in children {
        if let Err(e) = child.kill().await {
            warn!(butler = %name, error = %e, "failed to stop daemon");
        }
    }
    Ok(())
}
