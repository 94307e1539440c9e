//! MCP tool surface for a butler daemon.
//!
//! Each tool is a thin shim over [`ButlerDaemon`] methods. Tool failures are
//! returned as error results (never protocol errors) so callers always see
//! a structured `{error}` payload with a stable code where one exists.

use std::str::FromStr;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{
        CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    schemars, tool, tool_handler, tool_router,
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use butlers_contracts::parse_heartbeat;
use butlers_delivery::{DeadLetterFilter, ErrorClass};
use butlers_scheduler::ScheduleUpdate;
use butlers_spawner::TriggerOptions;

use crate::daemon::ButlerDaemon;
use crate::mailbox::MailboxMessage;

fn mcp_err(message: impl std::fmt::Display) -> McpError {
    McpError::internal_error(message.to_string(), None)
}

fn ok_json(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
    let rendered = serde_json::to_string_pretty(value).map_err(mcp_err)?;
    Ok(CallToolResult::success(vec![Content::text(rendered)]))
}

fn error_result(code: &str, message: impl std::fmt::Display) -> CallToolResult {
    CallToolResult::error(vec![Content::text(
        json!({"error": message.to_string(), "code": code}).to_string(),
    )])
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, CallToolResult> {
    Uuid::from_str(raw).map_err(|_| error_result("invalid_id", format!("invalid {field}: {raw}")))
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RouteExecuteParams {
    /// Full `route.v1` envelope.
    pub envelope: Value,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TriggerParams {
    /// Prompt to run in a new LLM session.
    pub prompt: String,
    /// Label recorded as the session's trigger source.
    #[serde(default)]
    pub trigger_source: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ScheduleCreateParams {
    pub name: String,
    /// Standard 5-field cron expression.
    pub cron: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ScheduleUpdateParams {
    /// Schedule id (UUID).
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ScheduleIdParams {
    /// Schedule id (UUID).
    pub id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ScheduleToggleParams {
    /// Schedule id (UUID).
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct MailboxPostParams {
    /// Posting butler's name.
    pub sender: String,
    /// Channel the sender received the originating request on.
    pub sender_channel: String,
    pub body: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HeartbeatParams {
    /// Full `connector.heartbeat.v1` envelope.
    pub envelope: Value,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DeadLetterListParams {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub origin_butler: Option<String>,
    #[serde(default)]
    pub error_class: Option<String>,
    /// RFC3339 lower bound on creation time.
    #[serde(default)]
    pub since: Option<String>,
    /// Page size (default 50, max 500).
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub include_discarded: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DeadLetterIdParams {
    /// Dead letter id (UUID).
    pub id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DeadLetterDiscardParams {
    /// Dead letter id (UUID).
    pub id: String,
    /// Non-empty reason recorded on the row.
    pub reason: String,
}

/// MCP server for one butler daemon.
#[derive(Clone)]
pub struct ButlerMcpServer {
    daemon: Arc<ButlerDaemon>,
    tool_router: ToolRouter<Self>,
}

impl ButlerMcpServer {
    /// Wrap a running daemon.
    pub fn new(daemon: Arc<ButlerDaemon>) -> Self {
        Self {
            daemon,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl ButlerMcpServer {
    /// Enqueue a routed request into this butler's durable inbox.
    #[tool(
        name = "route.execute",
        description = "Enqueue a route.v1 envelope into this butler's route inbox. Returns {status: accepted, row_id}."
    )]
    async fn route_execute(
        &self,
        Parameters(p): Parameters<RouteExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.daemon.route_execute(&p.envelope).await {
            Ok(row_id) => ok_json(&json!({"status": "accepted", "row_id": row_id.to_string()})),
            Err(e) => Ok(error_result("route_rejected", e)),
        }
    }

    /// Advance this butler's scheduler once.
    #[tool(description = "Advance the scheduler one tick, dispatching every due task.")]
    async fn tick(&self) -> Result<CallToolResult, McpError> {
        match self.daemon.tick().await {
            Ok(dispatched) => ok_json(&json!({"status": "ok", "tasks_run": dispatched})),
            Err(e) => Ok(error_result("tick_failed", e)),
        }
    }

    /// Run a prompt in a new LLM session.
    #[tool(description = "Run a prompt in a new LLM session under the concurrency bound.")]
    async fn trigger(
        &self,
        Parameters(p): Parameters<TriggerParams>,
    ) -> Result<CallToolResult, McpError> {
        let source = p.trigger_source.as_deref().unwrap_or("mcp:trigger");
        match self
            .daemon
            .spawner()
            .trigger(&p.prompt, source, TriggerOptions::default())
            .await
        {
            Ok(result) => ok_json(&json!({
                "session_id": result.session_id.map(|id| id.to_string()),
                "success": result.success,
                "result": result.result_text,
                "error": result.error,
                "duration_ms": result.duration_ms,
            })),
            Err(e) => Ok(error_result("spawner_unavailable", e)),
        }
    }

    /// Create a runtime schedule.
    #[tool(description = "Create a new scheduled task (source=db) from name, cron, and prompt.")]
    async fn schedule_create(
        &self,
        Parameters(p): Parameters<ScheduleCreateParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.daemon.scheduler().create(&p.name, &p.cron, &p.prompt).await {
            Ok(id) => ok_json(&json!({"status": "ok", "id": id.to_string()})),
            Err(e) => Ok(error_result(e.code(), e)),
        }
    }

    /// Update fields on a schedule.
    #[tool(
        description = "Update a scheduled task. Enabling recomputes next_run_at; disabling clears it."
    )]
    async fn schedule_update(
        &self,
        Parameters(p): Parameters<ScheduleUpdateParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = match parse_uuid(&p.id, "schedule id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        let update = ScheduleUpdate {
            name: p.name,
            cron: p.cron,
            prompt: p.prompt.map(Some),
            enabled: p.enabled,
            timezone: p.timezone.map(Some),
            ..ScheduleUpdate::default()
        };
        match self.daemon.scheduler().update(id, update).await {
            Ok(()) => ok_json(&json!({"status": "ok"})),
            Err(e) => Ok(error_result(e.code(), e)),
        }
    }

    /// Delete a runtime schedule.
    #[tool(description = "Delete a db-sourced scheduled task. TOML-sourced tasks are refused.")]
    async fn schedule_delete(
        &self,
        Parameters(p): Parameters<ScheduleIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = match parse_uuid(&p.id, "schedule id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        match self.daemon.scheduler().delete(id).await {
            Ok(()) => ok_json(&json!({"status": "ok"})),
            Err(e) => Ok(error_result(e.code(), e)),
        }
    }

    /// Enable or disable a schedule.
    #[tool(description = "Enable or disable a scheduled task.")]
    async fn schedule_toggle(
        &self,
        Parameters(p): Parameters<ScheduleToggleParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = match parse_uuid(&p.id, "schedule id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        match self.daemon.scheduler().toggle(id, p.enabled).await {
            Ok(()) => ok_json(&json!({"status": "ok", "enabled": p.enabled})),
            Err(e) => Ok(error_result(e.code(), e)),
        }
    }

    /// Run a schedule's prompt immediately.
    #[tool(description = "Run a scheduled task's prompt immediately, outside its cron cadence.")]
    async fn schedule_trigger(
        &self,
        Parameters(p): Parameters<ScheduleIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = match parse_uuid(&p.id, "schedule id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        let task = match self.daemon.scheduler().store().get(id).await {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(error_result("schedule_not_found", format!("no schedule {id}"))),
            Err(e) => return Ok(error_result(e.code(), e)),
        };
        let Some(prompt) = task.prompt else {
            return Ok(error_result(
                "schedule_not_triggerable",
                "schedule has no prompt",
            ));
        };
        let source = format!("schedule_trigger:{}", task.name);
        match self
            .daemon
            .spawner()
            .trigger(&prompt, &source, TriggerOptions::default())
            .await
        {
            Ok(result) => ok_json(&json!({
                "status": "ok",
                "session_id": result.session_id.map(|id| id.to_string()),
                "success": result.success,
            })),
            Err(e) => Ok(error_result("spawner_unavailable", e)),
        }
    }

    /// Append to this butler's mailbox.
    #[tool(description = "Post a message to this butler's mailbox (requires the mailbox module).")]
    async fn mailbox_post(
        &self,
        Parameters(p): Parameters<MailboxPostParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(mailbox) = self.daemon.mailbox() else {
            return Ok(error_result(
                "mailbox_not_enabled",
                format!(
                    "butler '{}' does not have the mailbox module enabled",
                    self.daemon.config().name
                ),
            ));
        };
        let message = MailboxMessage {
            id: Uuid::now_v7(),
            sender: p.sender,
            sender_channel: p.sender_channel,
            body: p.body,
            subject: p.subject,
            priority: p.priority,
            metadata: p.metadata,
            created_at: chrono::Utc::now(),
        };
        match mailbox.post(message).await {
            Ok(id) => ok_json(&json!({"status": "ok", "message_id": id.to_string()})),
            Err(e) => Ok(error_result("mailbox_post_failed", e)),
        }
    }

    /// Accept a connector heartbeat.
    #[tool(
        name = "connector.heartbeat",
        description = "Accept a connector.heartbeat.v1 envelope and record the connector's liveness."
    )]
    async fn connector_heartbeat(
        &self,
        Parameters(p): Parameters<HeartbeatParams>,
    ) -> Result<CallToolResult, McpError> {
        let envelope = match parse_heartbeat(&p.envelope) {
            Ok(envelope) => envelope,
            Err(e) => return Ok(error_result(e.code(), e)),
        };
        // The latest heartbeat per connector is the liveness view; keep it
        // in the state KV under a stable key.
        let key = format!(
            "connector_heartbeat/{}/{}",
            envelope.connector.connector_type, envelope.connector.endpoint_identity
        );
        if let Err(e) = self.daemon.state().set(&key, &p.envelope).await {
            return Ok(error_result(e.code(), e));
        }
        ok_json(&json!({"status": "accepted"}))
    }

    /// List dead-lettered deliveries.
    #[tool(
        description = "List dead-lettered deliveries with filters (channel, origin, error_class, since). Discarded rows excluded by default."
    )]
    async fn delivery_dead_letter_list(
        &self,
        Parameters(p): Parameters<DeadLetterListParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(delivery) = self.daemon.delivery() else {
            return Ok(error_result("delivery_not_enabled", "not the messenger butler"));
        };
        let error_class = match p.error_class.as_deref().map(ErrorClass::from_str) {
            Some(Err(e)) => return Ok(error_result("invalid_error_class", e)),
            Some(Ok(class)) => Some(class),
            None => None,
        };
        let since = match p.since.as_deref() {
            Some(raw) => match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(at) => Some(at.with_timezone(&chrono::Utc)),
                Err(e) => {
                    return Ok(error_result(
                        "invalid_since",
                        format!("invalid since timestamp '{raw}': {e}"),
                    ));
                }
            },
            None => None,
        };
        let filter = DeadLetterFilter {
            channel: p.channel,
            origin_butler: p.origin_butler,
            error_class,
            since,
            limit: p.limit,
            include_discarded: p.include_discarded,
        };
        match delivery.list_dead_letters(&filter).await {
            Ok(page) => ok_json(&json!({
                "dead_letters": page
                    .dead_letters
                    .iter()
                    .map(dead_letter_summary)
                    .collect::<Vec<_>>(),
                "count": page.count,
                "limit": page.limit,
                "include_discarded": p.include_discarded,
            })),
            Err(e) => Ok(error_result("dead_letter_list_failed", e)),
        }
    }

    /// Inspect one dead letter in full.
    #[tool(
        description = "Return the full dead letter record, including the original envelope, all attempt outcomes, and a replay eligibility assessment."
    )]
    async fn delivery_dead_letter_inspect(
        &self,
        Parameters(p): Parameters<DeadLetterIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(delivery) = self.daemon.delivery() else {
            return Ok(error_result("delivery_not_enabled", "not the messenger butler"));
        };
        let id = match parse_uuid(&p.id, "dead letter id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        match delivery.inspect_dead_letter(id).await {
            Ok(Some(record)) => {
                let mut rendered = dead_letter_summary(&record);
                rendered["original_request_envelope"] =
                    record.original_request_envelope.clone();
                rendered["all_attempt_outcomes"] = record.all_attempt_outcomes.clone();
                rendered["discard_reason"] = json!(record.discard_reason);
                rendered["replay_eligibility_assessment"] =
                    serde_json::to_value(record.replay_assessment()).map_err(mcp_err)?;
                ok_json(&rendered)
            }
            Ok(None) => Ok(error_result(
                "dead_letter_not_found",
                format!("dead letter not found: {id}"),
            )),
            Err(e) => Ok(error_result("dead_letter_inspect_failed", e)),
        }
    }

    /// Replay a dead-lettered delivery.
    #[tool(
        description = "Re-admit a dead-lettered delivery under a replay-suffixed idempotency key."
    )]
    async fn delivery_dead_letter_replay(
        &self,
        Parameters(p): Parameters<DeadLetterIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(delivery) = self.daemon.delivery() else {
            return Ok(error_result("delivery_not_enabled", "not the messenger butler"));
        };
        let id = match parse_uuid(&p.id, "dead letter id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        match delivery.replay_dead_letter(id).await {
            Ok(replay) => ok_json(&json!({
                "status": "ok",
                "replayed_delivery_id": replay.replayed_delivery_id.to_string(),
                "original_dead_letter_id": replay.original_dead_letter_id.to_string(),
                "replay_number": replay.replay_number,
            })),
            Err(e) => Ok(error_result("dead_letter_replay_refused", e)),
        }
    }

    /// Permanently discard a dead letter.
    #[tool(description = "Permanently discard a dead letter. Requires a non-empty reason.")]
    async fn delivery_dead_letter_discard(
        &self,
        Parameters(p): Parameters<DeadLetterDiscardParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(delivery) = self.daemon.delivery() else {
            return Ok(error_result("delivery_not_enabled", "not the messenger butler"));
        };
        let id = match parse_uuid(&p.id, "dead letter id") {
            Ok(id) => id,
            Err(result) => return Ok(result),
        };
        match delivery.discard_dead_letter(id, &p.reason).await {
            Ok(()) => ok_json(&json!({"status": "ok", "dead_letter_id": p.id})),
            Err(e) => Ok(error_result("dead_letter_discard_refused", e)),
        }
    }
}

fn dead_letter_summary(record: &butlers_delivery::DeadLetterRecord) -> Value {
    json!({
        "id": record.id.to_string(),
        "delivery_request_id": record.delivery_request_id.to_string(),
        "origin_butler": record.origin_butler,
        "channel": record.channel,
        "intent": record.intent,
        "quarantine_reason": record.quarantine_reason,
        "error_class": record.error_class.as_str(),
        "error_summary": record.error_summary,
        "total_attempts": record.total_attempts,
        "first_attempt_at": record.first_attempt_at,
        "last_attempt_at": record.last_attempt_at,
        "replay_eligible": record.replay_eligible,
        "replay_count": record.replay_count,
        "discarded_at": record.discarded_at,
        "created_at": record.created_at,
    })
}

#[tool_handler]
impl ServerHandler for ButlerMcpServer {
    fn get_info(&self) -> ServerInfo {
        let config = self.daemon.config();
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: format!("butler-{}", config.name),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some(format!("{} butler", config.name)),
                description: Some(config.description.clone()),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "{} butler daemon. Use route_execute to enqueue routed requests, tick to \
                 advance the scheduler, schedule_* to manage scheduled tasks, and \
                 mailbox_post to leave mail for this butler.",
                config.name
            )),
        }
    }
}
