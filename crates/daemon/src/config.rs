use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use butlers_scheduler::TomlScheduleEntry;

/// Errors loading a butler configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid butler.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Database settings for one butler.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// Connection DSN. The runtime role travels in the DSN
    /// (`postgres://butler_<schema>_rw@...`). Empty means in-memory stores
    /// (development only).
    #[serde(default)]
    pub dsn: Option<String>,
    /// Schema owning this butler's tables; defaults to the butler name.
    #[serde(default)]
    pub schema: Option<String>,
}

/// Runtime adapter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Adapter name (`gemini`, `mock`).
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// Per-invocation timeout in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_adapter() -> String {
    "gemini".into()
}

fn default_max_concurrent_sessions() -> usize {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            model: None,
            max_concurrent_sessions: default_max_concurrent_sessions(),
            timeout_seconds: None,
        }
    }
}

/// OpenTelemetry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    /// `grpc` or `http`.
    #[serde(default = "default_otlp_protocol")]
    pub protocol: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
    #[serde(default)]
    pub resource_attributes: HashMap<String, String>,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".into()
}

fn default_otlp_protocol() -> String {
    "grpc".into()
}

fn default_service_name() -> String {
    "butlers".into()
}

fn default_sample_ratio() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otlp_endpoint(),
            protocol: default_otlp_protocol(),
            service_name: default_service_name(),
            sample_ratio: default_sample_ratio(),
            resource_attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ButlerSection {
    name: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    description: String,
    #[serde(default)]
    modules: Vec<String>,
    #[serde(default)]
    db: DbConfig,
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default)]
    schedule: Vec<TomlScheduleEntry>,
}

fn default_port() -> u16 {
    4000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    butler: ButlerSection,
    #[serde(default)]
    telemetry: TelemetryConfig,
}

/// Fully-loaded configuration for one butler daemon.
#[derive(Debug, Clone)]
pub struct ButlerConfig {
    pub name: String,
    pub port: u16,
    pub description: String,
    pub modules: Vec<String>,
    pub db: DbConfig,
    pub runtime: RuntimeConfig,
    pub schedules: Vec<TomlScheduleEntry>,
    pub telemetry: TelemetryConfig,
}

impl ButlerConfig {
    /// Load `butler.toml` from a butler directory.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join("butler.toml");
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(raw)?;
        let butler = file.butler;
        if butler.name.trim().is_empty() {
            return Err(ConfigError::Invalid("butler.name must be non-empty".into()));
        }
        Ok(Self {
            name: butler.name,
            port: butler.port,
            description: butler.description,
            modules: butler.modules,
            db: butler.db,
            runtime: butler.runtime,
            schedules: butler.schedule,
            telemetry: file.telemetry,
        })
    }

    /// Schema owning this butler's tables.
    #[must_use]
    pub fn schema(&self) -> &str {
        self.db.schema.as_deref().unwrap_or(&self.name)
    }

    /// Whether the named module is enabled.
    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }

    /// The endpoint URL other butlers use to reach this daemon.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("http://localhost:{}/sse", self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[butler]
name = "health"
port = 4010
description = "Health tracking butler"
modules = ["mailbox", "health"]

[butler.db]
dsn = "postgres://butler_health_rw@localhost:5432/butlers"

[butler.runtime]
adapter = "gemini"
model = "gemini-2.0-flash"
max_concurrent_sessions = 2

[[butler.schedule]]
name = "morning-checkin"
cron = "0 8 * * *"
prompt = "Review overnight health data and flag anomalies."

[[butler.schedule]]
name = "weekly-report"
cron = "0 9 * * 1"
prompt = "Write the weekly health summary."
timezone = "America/New_York"

[telemetry]
enabled = true
service_name = "butler-health"
"#;

    #[test]
    fn parses_full_config() {
        let config = ButlerConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.name, "health");
        assert_eq!(config.port, 4010);
        assert_eq!(config.schema(), "health");
        assert!(config.has_module("mailbox"));
        assert!(!config.has_module("finance"));
        assert_eq!(config.runtime.max_concurrent_sessions, 2);
        assert_eq!(config.schedules.len(), 2);
        assert_eq!(config.schedules[1].timezone.as_deref(), Some("America/New_York"));
        assert!(config.telemetry.enabled);
        assert_eq!(config.endpoint_url(), "http://localhost:4010/sse");
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ButlerConfig::from_toml("[butler]\nname = \"general\"\n").unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.runtime.adapter, "gemini");
        assert_eq!(config.runtime.max_concurrent_sessions, 3);
        assert!(config.db.dsn.is_none());
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.sample_ratio, 1.0);
    }

    #[test]
    fn rejects_unknown_keys_and_blank_name() {
        assert!(ButlerConfig::from_toml("[butler]\nname = \"x\"\nbogus = 1\n").is_err());
        assert!(ButlerConfig::from_toml("[butler]\nname = \"  \"\n").is_err());
    }

    #[test]
    fn load_reads_butler_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("butler.toml"), "[butler]\nname = \"memory\"\n").unwrap();
        let config = ButlerConfig::load(dir.path()).unwrap();
        assert_eq!(config.name, "memory");

        let missing = ButlerConfig::load(&dir.path().join("nope"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
