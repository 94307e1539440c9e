use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::adapter::{
    EnvPolicy, InvocationOutput, InvocationRequest, McpServerConfig, RuntimeAdapter, TokenUsage,
    ToolCall,
};
use crate::error::RuntimeError;

/// Default wall-clock budget for one Gemini CLI invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Keys that must never reach the Gemini subprocess.
const DENIED_ENV_KEYS: [&str; 1] = ["ANTHROPIC_API_KEY"];

/// [`RuntimeAdapter`] for the Google Gemini CLI.
///
/// Invokes the `gemini` binary with `--prompt` and `--sandbox=false`, writes
/// MCP servers to a JSON config file (`mcpServers` key), reads the system
/// prompt from `GEMINI.md` (falling back to `AGENTS.md`), and parses the
/// CLI's JSON-lines output into text and tool-call records. A timeout kills
/// the subprocess and surfaces [`RuntimeError::Timeout`].
#[derive(Debug, Clone, Default)]
pub struct GeminiAdapter {
    /// Override for the binary path, used by tests; `None` means PATH lookup.
    binary_override: Option<PathBuf>,
}

impl GeminiAdapter {
    /// Adapter resolving the `gemini` binary from PATH.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter pinned to a specific binary path.
    #[must_use]
    pub fn with_binary(path: impl Into<PathBuf>) -> Self {
        Self {
            binary_override: Some(path.into()),
        }
    }

    fn find_binary(&self) -> Result<PathBuf, RuntimeError> {
        if let Some(ref path) = self.binary_override {
            return Ok(path.clone());
        }
        search_path(&std::env::var_os("PATH").unwrap_or_default()).ok_or_else(|| {
            RuntimeError::MissingBinary {
                binary: "gemini".into(),
                hint: "install the Gemini CLI and ensure it is on PATH".into(),
            }
        })
    }
}

/// Locate the `gemini` binary in a PATH-style search list.
fn search_path(path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join("gemini"))
        .find(|candidate| candidate.is_file())
}

#[async_trait::async_trait]
impl RuntimeAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput, RuntimeError> {
        let binary = self.find_binary()?;
        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);

        let mut command = Command::new(&binary);
        command
            .arg("--prompt")
            .arg(&request.prompt)
            .arg("--sandbox=false")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear()
            .envs(self.env_policy().filter(&request.env));

        if let Some(ref system_prompt) = request.system_prompt {
            command.arg("--system-prompt").arg(system_prompt);
        }
        if let Some(ref model) = request.model {
            command.arg("--model").arg(model);
        }
        if let Some(max_turns) = request.max_turns {
            command.arg("--max-turns").arg(max_turns.to_string());
        }
        if let Some(ref cwd) = request.cwd {
            command.current_dir(cwd);
        }

        debug!(binary = %binary.display(), timeout_s = timeout.as_secs(), "invoking gemini");

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::Process(format!("failed to spawn gemini: {e}")))?;

        let mut stdout_pipe = child.stdout.take().expect("stdout is piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr is piped");

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let (status, _, _) = tokio::try_join!(
                child.wait(),
                stdout_pipe.read_to_string(&mut stdout),
                stderr_pipe.read_to_string(&mut stderr),
            )
            .map_err(|e| RuntimeError::Process(e.to_string()))?;
            Ok::<_, RuntimeError>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaps the child once the future is dropped.
                error!(timeout_s = timeout.as_secs(), "gemini invocation timed out");
                return Err(RuntimeError::Timeout(timeout));
            }
        };

        Ok(parse_output(
            &stdout,
            &stderr,
            status.code().unwrap_or(-1),
        ))
    }

    fn build_config_file(
        &self,
        mcp_servers: &[McpServerConfig],
        tmp_dir: &Path,
    ) -> Result<PathBuf, RuntimeError> {
        let mut servers = serde_json::Map::new();
        for server in mcp_servers {
            let mut entry = serde_json::Map::new();
            if let Some(ref url) = server.url {
                entry.insert("url".into(), json!(url));
            }
            if let Some(ref command) = server.command {
                entry.insert("command".into(), json!(command));
                entry.insert("args".into(), json!(server.args));
            }
            if !server.env.is_empty() {
                entry.insert("env".into(), json!(server.env));
            }
            servers.insert(server.name.clone(), Value::Object(entry));
        }
        let config = json!({ "mcpServers": servers });

        let path = tmp_dir.join("gemini-settings.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&config).expect("config is valid JSON"))
            .map_err(|e| RuntimeError::Configuration(format!("failed to write MCP config: {e}")))?;
        Ok(path)
    }

    fn parse_system_prompt_file(&self, config_dir: &Path) -> Result<String, RuntimeError> {
        for candidate in ["GEMINI.md", "AGENTS.md"] {
            let path = config_dir.join(candidate);
            if path.is_file() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    RuntimeError::Configuration(format!(
                        "failed to read {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Err(RuntimeError::Configuration(format!(
            "no GEMINI.md or AGENTS.md in {}",
            config_dir.display()
        )))
    }

    fn create_worker(&self) -> Arc<dyn RuntimeAdapter> {
        Arc::new(self.clone())
    }

    fn env_policy(&self) -> EnvPolicy {
        EnvPolicy::deny(DENIED_ENV_KEYS)
    }
}

/// Parse Gemini CLI output into an [`InvocationOutput`].
///
/// The CLI may emit JSON-lines (`message`, `tool_use`/`functionCall`,
/// `result` objects) or plain text; non-JSON lines accumulate as text. A
/// non-zero exit code yields an error-text result rather than a hard
/// failure, matching how dispatch failures are recorded on the session row.
fn parse_output(stdout: &str, stderr: &str, exit_code: i32) -> InvocationOutput {
    if exit_code != 0 {
        let detail = if !stderr.trim().is_empty() {
            stderr.trim().to_owned()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_owned()
        } else {
            format!("exit code {exit_code}")
        };
        error!(exit_code, "gemini exited non-zero");
        return InvocationOutput {
            result_text: Some(format!("Error: {detail}")),
            tool_calls: Vec::new(),
            usage: None,
        };
    }

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<TokenUsage> = None;
    let mut final_result: Option<String> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) else {
            text_parts.push(line.to_owned());
            continue;
        };

        match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
            "message" => match obj.get("content") {
                Some(Value::String(content)) if !content.is_empty() => {
                    text_parts.push(content.clone());
                }
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    text_parts.push(text.to_owned());
                                }
                            }
                            Some("tool_use" | "functionCall") => {
                                tool_calls.push(extract_tool_call(block));
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            },
            "tool_use" | "functionCall" => {
                tool_calls.push(extract_tool_call(&Value::Object(obj.clone())));
            }
            "result" => {
                if let Some(text) = obj.get("result").and_then(Value::as_str) {
                    final_result = Some(text.to_owned());
                }
                if let Some(u) = obj.get("usage") {
                    usage = Some(TokenUsage {
                        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                        output_tokens: u
                            .get("output_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    });
                }
            }
            other => {
                if !other.is_empty() {
                    warn!(line_type = other, "unrecognized gemini output line");
                }
            }
        }
    }

    let result_text = final_result.or_else(|| {
        if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        }
    });

    InvocationOutput {
        result_text,
        tool_calls,
        usage,
    }
}

fn extract_tool_call(block: &Value) -> ToolCall {
    let name = block
        .get("name")
        .or_else(|| block.get("tool_name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    let arguments = block
        .get("input")
        .or_else(|| block.get("args"))
        .or_else(|| block.get("arguments"))
        .cloned()
        .unwrap_or(Value::Null);
    ToolCall { name, arguments }
}
