use std::path::Path;

use anyhow::{Context, bail};

/// `butlers init` -- scaffold a new butler directory.
pub fn run(name: &str, port: Option<u16>, dir: &Path) -> anyhow::Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        bail!("butler name must be lowercase ascii (got '{name}')");
    }

    let butler_dir = dir.join(name);
    if butler_dir.exists() {
        bail!("butler directory already exists: {}", butler_dir.display());
    }
    std::fs::create_dir_all(&butler_dir)
        .with_context(|| format!("failed to create {}", butler_dir.display()))?;

    let port = port.unwrap_or(4000);
    let config = format!(
        r#"[butler]
name = "{name}"
port = {port}
description = ""
modules = ["mailbox"]

[butler.db]
# dsn = "postgres://butler_{name}_rw@localhost:5432/butlers"

[butler.runtime]
adapter = "gemini"
max_concurrent_sessions = 3

# [[butler.schedule]]
# name = "morning-brief"
# cron = "0 8 * * *"
# prompt = "Summarize what needs attention today."
"#
    );
    std::fs::write(butler_dir.join("butler.toml"), config)
        .with_context(|| format!("failed to write {}", butler_dir.display()))?;

    println!("created {}", butler_dir.join("butler.toml").display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaffolds_a_parseable_config() {
        let dir = tempfile::tempdir().unwrap();
        run("relationship", Some(4017), dir.path()).unwrap();

        let config =
            butlers_daemon::ButlerConfig::load(&dir.path().join("relationship")).unwrap();
        assert_eq!(config.name, "relationship");
        assert_eq!(config.port, 4017);
        assert!(config.has_module("mailbox"));
    }

    #[test]
    fn refuses_existing_directory_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        run("health", None, dir.path()).unwrap();
        assert!(run("health", None, dir.path()).is_err());
        assert!(run("Not A Name", None, dir.path()).is_err());
    }
}
