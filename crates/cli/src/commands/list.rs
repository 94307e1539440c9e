use std::path::Path;
use std::time::Duration;

use tokio::net::TcpStream;

use super::discover_roster;

/// Whether a daemon answers on the butler's port.
async fn is_running(port: u16) -> bool {
    tokio::time::timeout(
        Duration::from_millis(500),
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .is_ok_and(|result| result.is_ok())
}

/// `butlers list` -- print the roster with per-butler status.
pub async fn run(dir: &Path) -> anyhow::Result<()> {
    let butlers = discover_roster(dir)?;
    if butlers.is_empty() {
        println!("no butlers found in {}", dir.display());
        return Ok(());
    }

    println!(
        "{:<14} {:>6}  {:<9} {:<28} {}",
        "NAME", "PORT", "STATUS", "MODULES", "DESCRIPTION"
    );
    for (_, config) in &butlers {
        let status = if is_running(config.port).await {
            "running"
        } else {
            "stopped"
        };
        println!(
            "{:<14} {:>6}  {:<9} {:<28} {}",
            config.name,
            config.port,
            status,
            config.modules.join(","),
            config.description,
        );
    }
    Ok(())
}
