use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::adapter::{
    EnvPolicy, InvocationOutput, InvocationRequest, McpServerConfig, RuntimeAdapter, ToolCall,
};
use crate::error::RuntimeError;

/// Adapter that returns a canned response, optionally after a delay.
///
/// The delay makes it useful for exercising concurrency bounds and drain
/// deadlines.
#[derive(Debug)]
pub struct MockAdapter {
    response: String,
    delay: Option<Duration>,
    tool_calls: Vec<String>,
    invocations: AtomicUsize,
}

impl MockAdapter {
    /// Adapter that immediately completes with `response`.
    #[must_use]
    pub fn completing(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            delay: None,
            tool_calls: Vec::new(),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Adapter that sleeps for `delay` before completing.
    #[must_use]
    pub fn slow(response: impl Into<String>, delay: Duration) -> Self {
        Self {
            response: response.into(),
            delay: Some(delay),
            tool_calls: Vec::new(),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Record the given tool names on every invocation.
    #[must_use]
    pub fn with_tool_calls(mut self, names: Vec<String>) -> Self {
        self.tool_calls = names;
        self
    }

    /// Number of completed invocations.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RuntimeAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput, RuntimeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(InvocationOutput {
            result_text: Some(self.response.clone()),
            tool_calls: self
                .tool_calls
                .iter()
                .map(|name| ToolCall {
                    name: name.clone(),
                    arguments: serde_json::Value::Null,
                })
                .collect(),
            usage: None,
        })
    }

    fn build_config_file(
        &self,
        _mcp_servers: &[McpServerConfig],
        tmp_dir: &Path,
    ) -> Result<PathBuf, RuntimeError> {
        Ok(tmp_dir.join("mock-config.json"))
    }

    fn parse_system_prompt_file(&self, _config_dir: &Path) -> Result<String, RuntimeError> {
        Ok(String::new())
    }

    fn create_worker(&self) -> Arc<dyn RuntimeAdapter> {
        Arc::new(Self {
            response: self.response.clone(),
            delay: self.delay,
            tool_calls: self.tool_calls.clone(),
            invocations: AtomicUsize::new(0),
        })
    }

    fn env_policy(&self) -> EnvPolicy {
        EnvPolicy::default()
    }
}

/// Adapter that always fails, for exercising error recording.
#[derive(Debug, Clone)]
pub struct FailingAdapter {
    pub message: String,
}

impl FailingAdapter {
    /// Adapter failing with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeAdapter for FailingAdapter {
    fn name(&self) -> &str {
        "failing"
    }

    async fn invoke(&self, _request: &InvocationRequest) -> Result<InvocationOutput, RuntimeError> {
        Err(RuntimeError::Process(self.message.clone()))
    }

    fn build_config_file(
        &self,
        _mcp_servers: &[McpServerConfig],
        tmp_dir: &Path,
    ) -> Result<PathBuf, RuntimeError> {
        Ok(tmp_dir.join("mock-config.json"))
    }

    fn parse_system_prompt_file(&self, _config_dir: &Path) -> Result<String, RuntimeError> {
        Ok(String::new())
    }

    fn create_worker(&self) -> Arc<dyn RuntimeAdapter> {
        Arc::new(self.clone())
    }

    fn env_policy(&self) -> EnvPolicy {
        EnvPolicy::default()
    }
}
