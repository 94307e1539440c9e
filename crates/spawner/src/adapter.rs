use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RuntimeError, SpawnerError};
use crate::gemini::GeminiAdapter;
use crate::mock::MockAdapter;

/// One MCP server the runtime should connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    /// SSE endpoint URL, for HTTP-transport servers.
    #[serde(default)]
    pub url: Option<String>,
    /// Command line, for stdio-transport servers.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A recorded tool invocation inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Token accounting reported by the runtime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Everything an adapter needs to run one session.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub mcp_servers: Vec<McpServerConfig>,
    pub env: HashMap<String, String>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl InvocationRequest {
    /// A request with just a prompt; everything else defaulted.
    #[must_use]
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            mcp_servers: Vec::new(),
            env: HashMap::new(),
            max_turns: None,
            model: None,
            cwd: None,
            timeout: None,
        }
    }
}

/// What an adapter invocation produced.
#[derive(Debug, Clone, Default)]
pub struct InvocationOutput {
    pub result_text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

/// Environment filtering applied before handing variables to a runtime
/// subprocess. Deny wins over allow; an empty allow list forwards everything
/// not denied.
#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    pub allowed: HashSet<String>,
    pub denied: HashSet<String>,
}

impl EnvPolicy {
    /// Policy that denies the given keys and forwards the rest.
    #[must_use]
    pub fn deny<I: IntoIterator<Item = S>, S: Into<String>>(keys: I) -> Self {
        Self {
            allowed: HashSet::new(),
            denied: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Apply the policy to an environment map.
    #[must_use]
    pub fn filter(&self, env: &HashMap<String, String>) -> HashMap<String, String> {
        env.iter()
            .filter(|(k, _)| !self.denied.contains(*k))
            .filter(|(k, _)| self.allowed.is_empty() || self.allowed.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A pluggable LLM runtime.
///
/// Adapters encapsulate one CLI/runtime family: how to invoke it, how to
/// write its MCP config, where its per-butler system prompt lives, and which
/// environment variables it may see.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Adapter name as used in configuration (`"gemini"`, `"mock"`).
    fn name(&self) -> &str;

    /// Execute one session. May fail with timeout or missing-binary errors.
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput, RuntimeError>;

    /// Write the adapter-specific MCP config into `tmp_dir`, returning its
    /// path.
    fn build_config_file(
        &self,
        mcp_servers: &[McpServerConfig],
        tmp_dir: &Path,
    ) -> Result<PathBuf, RuntimeError>;

    /// Read the per-butler system prompt from `config_dir`.
    fn parse_system_prompt_file(&self, config_dir: &Path) -> Result<String, RuntimeError>;

    /// Return a fresh, independent adapter for a pooled worker.
    fn create_worker(&self) -> Arc<dyn RuntimeAdapter>;

    /// The environment filtering policy for this runtime's subprocesses.
    fn env_policy(&self) -> EnvPolicy;
}

/// Names accepted by [`create_adapter`].
#[must_use]
pub fn registered_adapters() -> &'static [&'static str] {
    &["gemini", "mock"]
}

/// Construct an adapter by its configured name.
pub fn create_adapter(name: &str) -> Result<Arc<dyn RuntimeAdapter>, SpawnerError> {
    match name {
        "gemini" => Ok(Arc::new(GeminiAdapter::new())),
        "mock" => Ok(Arc::new(MockAdapter::completing("ok"))),
        other => Err(SpawnerError::UnknownAdapter(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_policy_denies_and_allows() {
        let mut env = HashMap::new();
        env.insert("GOOGLE_API_KEY".to_owned(), "g".to_owned());
        env.insert("ANTHROPIC_API_KEY".to_owned(), "a".to_owned());
        env.insert("PATH".to_owned(), "/usr/bin".to_owned());

        let deny_only = EnvPolicy::deny(["ANTHROPIC_API_KEY"]);
        let filtered = deny_only.filter(&env);
        assert!(filtered.contains_key("GOOGLE_API_KEY"));
        assert!(filtered.contains_key("PATH"));
        assert!(!filtered.contains_key("ANTHROPIC_API_KEY"));

        let allow_list = EnvPolicy {
            allowed: ["GOOGLE_API_KEY".to_owned()].into_iter().collect(),
            denied: HashSet::new(),
        };
        let filtered = allow_list.filter(&env);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("GOOGLE_API_KEY"));
    }

    #[test]
    fn registry_knows_its_adapters() {
        assert!(registered_adapters().contains(&"gemini"));
        assert!(create_adapter("mock").is_ok());
        assert!(matches!(
            create_adapter("hal9000"),
            Err(SpawnerError::UnknownAdapter(_))
        ));
    }
}
