pub mod init;
pub mod list;
pub mod migrate;
pub mod run;
pub mod up;

use std::path::{Path, PathBuf};

use anyhow::Context;

use butlers_daemon::ButlerConfig;

/// Discover `roster/*/butler.toml` entries, sorted by name.
pub fn discover_roster(dir: &Path) -> anyhow::Result<Vec<(PathBuf, ButlerConfig)>> {
    let mut butlers = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read roster directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() || !path.join("butler.toml").is_file() {
            continue;
        }
        let config = ButlerConfig::load(&path)
            .with_context(|| format!("invalid butler config in {}", path.display()))?;
        butlers.push((path, config));
    }
    butlers.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    Ok(butlers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_and_sorts_roster_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha"] {
            let butler_dir = dir.path().join(name);
            std::fs::create_dir(&butler_dir).unwrap();
            std::fs::write(
                butler_dir.join("butler.toml"),
                format!("[butler]\nname = \"{name}\"\n"),
            )
            .unwrap();
        }
        // Directories without a butler.toml are ignored.
        std::fs::create_dir(dir.path().join("not-a-butler")).unwrap();

        let butlers = discover_roster(dir.path()).unwrap();
        let names: Vec<&str> = butlers.iter().map(|(_, c)| c.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn missing_roster_dir_is_an_error() {
        assert!(discover_roster(Path::new("/nonexistent/roster")).is_err());
    }
}
