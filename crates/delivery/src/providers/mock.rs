use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{ChannelProvider, ProviderReceipt};
use crate::error::{ErrorClass, ProviderSendError};
use crate::request::DeliveryRequestRow;

/// What the mock should do on one attempt.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Deliver,
    Fail(ErrorClass),
}

/// Scripted provider for engine tests.
///
/// Outcomes are consumed in order; once the script is exhausted, every
/// further attempt delivers.
pub struct MockProvider {
    channel: String,
    script: Mutex<Vec<ScriptedOutcome>>,
    sends: AtomicUsize,
}

impl MockProvider {
    /// Provider on `channel` that always delivers.
    #[must_use]
    pub fn delivering(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            script: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
        }
    }

    /// Provider that follows `script` (first element first), then delivers.
    #[must_use]
    pub fn scripted(channel: impl Into<String>, script: Vec<ScriptedOutcome>) -> Self {
        Self {
            channel: channel.into(),
            script: Mutex::new(script),
            sends: AtomicUsize::new(0),
        }
    }

    /// Provider that always fails with `class`.
    #[must_use]
    pub fn failing(channel: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            channel: channel.into(),
            // An empty script delivers, so script one failure and keep
            // replaying it.
            script: Mutex::new(vec![ScriptedOutcome::Fail(class); 64]),
            sends: AtomicUsize::new(0),
        }
    }

    /// Number of send attempts observed.
    #[must_use]
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(
        &self,
        request: &DeliveryRequestRow,
    ) -> Result<ProviderReceipt, ProviderSendError> {
        let send_number = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        let next = {
            let mut script = self.script.lock().expect("script mutex poisoned");
            if script.is_empty() {
                ScriptedOutcome::Deliver
            } else {
                script.remove(0)
            }
        };
        match next {
            ScriptedOutcome::Deliver => Ok(ProviderReceipt {
                provider_message_id: format!("mock-{}-{send_number}", request.id),
                raw: json!({"ok": true, "send": send_number}),
            }),
            ScriptedOutcome::Fail(class) => Err(ProviderSendError::new(
                class,
                format!("scripted failure on send {send_number}"),
            )),
        }
    }
}
