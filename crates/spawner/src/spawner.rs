use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::adapter::{InvocationRequest, RuntimeAdapter};
use crate::error::SpawnerError;
use crate::session::{NewSession, SessionCompletion, SessionStore};

/// Spawner tuning knobs.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Maximum LLM sessions in flight for this butler.
    pub max_concurrent_sessions: usize,
    /// Default model passed to the adapter when the trigger names none.
    pub model: Option<String>,
    /// Default per-invocation timeout.
    pub timeout: Option<Duration>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 3,
            model: None,
            timeout: None,
        }
    }
}

/// Optional lineage and context for one trigger.
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub parent_session_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub context: Option<String>,
    pub model: Option<String>,
    pub trace_id: Option<String>,
}

/// Outcome of one trigger.
#[derive(Debug, Clone)]
pub struct SpawnerResult {
    /// Null when no session store is configured.
    pub session_id: Option<Uuid>,
    pub result_text: Option<String>,
    pub tool_call_count: usize,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight sessions finished within the deadline.
    Clean,
    /// The deadline fired; stragglers were cancelled cooperatively.
    Cancelled,
}

/// Concurrency-bounded executor for LLM sessions.
pub struct Spawner {
    adapter: Arc<dyn RuntimeAdapter>,
    sessions: Option<Arc<dyn SessionStore>>,
    semaphore: Arc<Semaphore>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    config: SpawnerConfig,
}

impl Spawner {
    /// Build a spawner. `sessions` may be `None`, in which case no session
    /// rows are written and `session_id` stays null in results.
    pub fn new(
        adapter: Arc<dyn RuntimeAdapter>,
        sessions: Option<Arc<dyn SessionStore>>,
        config: SpawnerConfig,
    ) -> Self {
        let permits = config.max_concurrent_sessions.max(1);
        Self {
            adapter,
            sessions,
            semaphore: Arc::new(Semaphore::new(permits)),
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Number of sessions currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_sessions.max(1) - self.semaphore.available_permits()
    }

    /// Execute one LLM session for `prompt`.
    ///
    /// Suspends until a semaphore slot opens (this is the backpressure
    /// point), writes the session row, invokes the adapter inside a
    /// `butler.llm_session` span, and records the terminal state. Adapter
    /// failures are recorded on the session and returned as an unsuccessful
    /// result, not an `Err`; `Err` is reserved for spawner-level refusals.
    pub async fn trigger(
        &self,
        prompt: &str,
        trigger_source: &str,
        options: TriggerOptions,
    ) -> Result<SpawnerResult, SpawnerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SpawnerError::Draining);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("spawner semaphore is never closed");

        // Re-check after the (possibly long) wait for a slot.
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SpawnerError::Draining);
        }

        let model = options.model.clone().or_else(|| self.config.model.clone());
        let session_id = match &self.sessions {
            Some(store) => Some(
                store
                    .create(NewSession {
                        prompt: prompt.to_owned(),
                        trigger_source: trigger_source.to_owned(),
                        model: model.clone(),
                        parent_session_id: options.parent_session_id,
                        request_id: options.request_id,
                        trace_id: options.trace_id.clone(),
                    })
                    .await?,
            ),
            None => None,
        };

        let span = info_span!(
            "butler.llm_session",
            session_id = %session_id.map(|id| id.to_string()).unwrap_or_default(),
            trigger_source,
            model = model.as_deref().unwrap_or(""),
        );

        let full_prompt = match options.context {
            Some(ref context) => format!("{context}\n\n{prompt}"),
            None => prompt.to_owned(),
        };
        let request = InvocationRequest {
            prompt: full_prompt,
            system_prompt: None,
            mcp_servers: Vec::new(),
            env: std::env::vars().collect(),
            max_turns: None,
            model,
            cwd: None,
            timeout: self.config.timeout,
        };

        let started = Instant::now();
        let invocation = async {
            tokio::select! {
                result = self.adapter.invoke(&request) => Some(result),
                () = self.cancel.cancelled() => None,
            }
        }
        .instrument(span.clone())
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (completion, result) = match invocation {
            Some(Ok(output)) => {
                // Tool spans are emitted after the fact from the adapter's
                // records; each gets its own child span of this session, so
                // concurrent sessions never share span state.
                for call in &output.tool_calls {
                    let tool_span =
                        info_span!(parent: &span, "butler.tool", tool = %call.name);
                    let _entered = tool_span.enter();
                }

                let tool_calls_json =
                    serde_json::to_value(&output.tool_calls).unwrap_or(Value::Array(Vec::new()));
                let completion = SessionCompletion {
                    result: output.result_text.clone(),
                    tool_calls: tool_calls_json,
                    duration_ms: Some(duration_ms),
                    cost: None,
                    success: true,
                    error: None,
                    input_tokens: output.usage.map(|u| u.input_tokens),
                    output_tokens: output.usage.map(|u| u.output_tokens),
                };
                let result = SpawnerResult {
                    session_id,
                    result_text: output.result_text,
                    tool_call_count: output.tool_calls.len(),
                    success: true,
                    error: None,
                    duration_ms,
                };
                (completion, result)
            }
            Some(Err(e)) => {
                warn!(error = %e, "runtime invocation failed");
                let message = e.to_string();
                let completion = SessionCompletion {
                    duration_ms: Some(duration_ms),
                    success: false,
                    error: Some(message.clone()),
                    ..Default::default()
                };
                let result = SpawnerResult {
                    session_id,
                    result_text: None,
                    tool_call_count: 0,
                    success: false,
                    error: Some(message),
                    duration_ms,
                };
                (completion, result)
            }
            None => {
                info!("session cancelled by drain");
                let completion = SessionCompletion {
                    duration_ms: Some(duration_ms),
                    success: false,
                    error: Some("drained".into()),
                    ..Default::default()
                };
                let result = SpawnerResult {
                    session_id,
                    result_text: None,
                    tool_call_count: 0,
                    success: false,
                    error: Some("drained".into()),
                    duration_ms,
                };
                (completion, result)
            }
        };

        if let (Some(store), Some(id)) = (&self.sessions, session_id)
            && let Err(e) = store.complete(id, completion).await
        {
            warn!(session_id = %id, error = %e, "failed to record session completion");
        }

        Ok(result)
    }

    /// Stop accepting new triggers. In-flight sessions continue.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Drain: refuse new triggers, wait for in-flight sessions up to
    /// `timeout`, then cancel stragglers cooperatively. Cancelled sessions
    /// are marked `success = false, error = "drained"`.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        self.stop_accepting();
        let all = self.config.max_concurrent_sessions.max(1) as u32;

        match tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await {
            Ok(permits) => {
                drop(permits.expect("spawner semaphore is never closed"));
                info!("spawner drained cleanly");
                DrainOutcome::Clean
            }
            Err(_) => {
                warn!("drain deadline reached; cancelling outstanding sessions");
                self.cancel.cancel();
                // Give cancelled sessions a moment to record terminal state.
                let grace = Duration::from_secs(5);
                if let Ok(permits) =
                    tokio::time::timeout(grace, self.semaphore.acquire_many(all)).await
                {
                    drop(permits.expect("spawner semaphore is never closed"));
                }
                DrainOutcome::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingAdapter, MockAdapter};
    use crate::session::{MemorySessionStore, SessionStore};

    fn spawner_with(
        adapter: Arc<dyn RuntimeAdapter>,
        max: usize,
    ) -> (Arc<Spawner>, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::new());
        let spawner = Arc::new(Spawner::new(
            adapter,
            Some(Arc::clone(&sessions) as Arc<dyn SessionStore>),
            SpawnerConfig {
                max_concurrent_sessions: max,
                ..SpawnerConfig::default()
            },
        ));
        (spawner, sessions)
    }

    #[tokio::test]
    async fn trigger_records_successful_session() {
        let (spawner, sessions) = spawner_with(
            Arc::new(MockAdapter::completing("all good").with_tool_calls(vec![
                "calendar_list".into(),
                "mailbox_post".into(),
            ])),
            2,
        );

        let result = spawner
            .trigger("check my day", "schedule:morning", TriggerOptions::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result_text.as_deref(), Some("all good"));
        assert_eq!(result.tool_call_count, 2);

        let row = sessions
            .get(result.session_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.success, Some(true));
        assert!(!row.is_active());
        assert_eq!(row.tool_calls.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn adapter_failure_is_recorded_not_raised() {
        let (spawner, sessions) =
            spawner_with(Arc::new(FailingAdapter::new("binary exploded")), 1);

        let result = spawner
            .trigger("hi", "mcp:trigger", TriggerOptions::default())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("binary exploded"));

        let row = sessions
            .get(result.session_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.success, Some(false));
        assert!(row.error.as_deref().unwrap().contains("binary exploded"));
    }

    #[tokio::test]
    async fn no_session_store_means_no_session_id() {
        let spawner = Spawner::new(
            Arc::new(MockAdapter::completing("ok")),
            None,
            SpawnerConfig::default(),
        );
        let result = spawner
            .trigger("hi", "test", TriggerOptions::default())
            .await
            .unwrap();
        assert!(result.session_id.is_none());
        assert!(result.success);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let adapter = Arc::new(MockAdapter::slow("done", Duration::from_millis(100)));
        let (spawner, _) = spawner_with(Arc::clone(&adapter) as Arc<dyn RuntimeAdapter>, 2);

        let started = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&spawner);
            handles.push(tokio::spawn(async move {
                s.trigger("hi", "test", TriggerOptions::default()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().success);
        }
        // 4 sessions at 100ms each through 2 slots: at least two batches.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(adapter.invocations(), 4);
    }

    #[tokio::test]
    async fn draining_spawner_rejects_new_triggers() {
        let (spawner, _) = spawner_with(Arc::new(MockAdapter::completing("ok")), 1);
        spawner.stop_accepting();
        let err = spawner
            .trigger("hi", "test", TriggerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnerError::Draining));
    }

    #[tokio::test]
    async fn clean_drain_waits_for_in_flight() {
        let (spawner, _) = spawner_with(
            Arc::new(MockAdapter::slow("done", Duration::from_millis(50))),
            1,
        );
        let s = Arc::clone(&spawner);
        let handle = tokio::spawn(async move {
            s.trigger("hi", "test", TriggerOptions::default()).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = spawner.drain(Duration::from_secs(2)).await;
        assert_eq!(outcome, DrainOutcome::Clean);
        assert!(handle.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn drain_deadline_cancels_and_marks_sessions() {
        let (spawner, sessions) = spawner_with(
            Arc::new(MockAdapter::slow("never", Duration::from_secs(60))),
            1,
        );
        let s = Arc::clone(&spawner);
        let handle = tokio::spawn(async move {
            s.trigger("hi", "test", TriggerOptions::default()).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = spawner.drain(Duration::from_millis(50)).await;
        assert_eq!(outcome, DrainOutcome::Cancelled);

        let result = handle.await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("drained"));

        let row = sessions
            .get(result.session_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.error.as_deref(), Some("drained"));
        assert_eq!(row.success, Some(false));
        assert!(!row.is_active());
    }
}
