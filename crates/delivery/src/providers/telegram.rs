use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{ChannelProvider, ProviderReceipt};
use crate::error::{ErrorClass, ProviderSendError};
use crate::request::DeliveryRequestRow;

/// Telegram Bot API provider.
///
/// `send` and `reply` use `sendMessage` (replies carry
/// `reply_to_message_id` from the envelope's thread identity); `react` uses
/// `setMessageReaction` with the emoji from the envelope. HTTP 429 maps to
/// `rate_limited`, 4xx to `permanent_validation`, 5xx to `provider_error`.
pub struct TelegramProvider {
    token: String,
    client: reqwest::Client,
    api_base: String,
}

impl TelegramProvider {
    /// Provider using the public Bot API.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_api_base(token, "https://api.telegram.org")
    }

    /// Provider against an alternate API base (tests, local proxies).
    #[must_use]
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build HTTP client");
        Self {
            token: token.into(),
            client,
            api_base: api_base.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    /// Thread identity from the request's envelope lineage, when present.
    fn thread_message_id(request: &DeliveryRequestRow) -> Option<i64> {
        request
            .request_envelope
            .pointer("/request_context/source_thread_identity")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    fn emoji(request: &DeliveryRequestRow) -> Option<String> {
        request
            .request_envelope
            .pointer("/delivery/emoji")
            .and_then(Value::as_str)
            .map(str::to_owned)
    }

    async fn call(
        &self,
        method: &str,
        body: Value,
    ) -> Result<Value, ProviderSendError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderSendError::new(ErrorClass::Timeout, e.to_string())
                } else {
                    ProviderSendError::new(ErrorClass::TransientNetwork, e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let payload: Value = response.json().await.map_err(|e| {
            ProviderSendError::new(ErrorClass::ProviderError, format!("invalid response: {e}"))
        })?;

        if status == 429 {
            return Err(ProviderSendError::new(
                ErrorClass::RateLimited,
                payload
                    .pointer("/description")
                    .and_then(Value::as_str)
                    .unwrap_or("too many requests")
                    .to_owned(),
            ));
        }
        if !(200..300).contains(&status) {
            let description = payload
                .pointer("/description")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_owned();
            let class = if (500..600).contains(&status) {
                ErrorClass::ProviderError
            } else {
                ErrorClass::PermanentValidation
            };
            return Err(ProviderSendError::new(class, format!("{status}: {description}")));
        }
        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            warn!(method, "telegram returned ok=false");
            return Err(ProviderSendError::new(
                ErrorClass::ProviderError,
                payload
                    .pointer("/description")
                    .and_then(Value::as_str)
                    .unwrap_or("ok=false")
                    .to_owned(),
            ));
        }
        Ok(payload)
    }
}

#[async_trait]
impl ChannelProvider for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
    }

    fn channel(&self) -> &str {
        "telegram"
    }

    async fn send(
        &self,
        request: &DeliveryRequestRow,
    ) -> Result<ProviderReceipt, ProviderSendError> {
        let chat_id = request.target_identity.as_deref().ok_or_else(|| {
            ProviderSendError::new(
                ErrorClass::PermanentValidation,
                "telegram delivery requires a target chat id",
            )
        })?;

        let payload = match request.intent.as_str() {
            "react" => {
                let message_id = Self::thread_message_id(request).ok_or_else(|| {
                    ProviderSendError::new(
                        ErrorClass::PermanentValidation,
                        "reaction requires a numeric thread message id",
                    )
                })?;
                let emoji = Self::emoji(request).ok_or_else(|| {
                    ProviderSendError::new(
                        ErrorClass::PermanentValidation,
                        "reaction requires an emoji",
                    )
                })?;
                debug!(chat_id, message_id, "sending telegram reaction");
                self.call(
                    "setMessageReaction",
                    json!({
                        "chat_id": chat_id,
                        "message_id": message_id,
                        "reaction": [{"type": "emoji", "emoji": emoji}],
                    }),
                )
                .await?
            }
            intent => {
                let mut body = json!({
                    "chat_id": chat_id,
                    "text": request.message_content,
                });
                if intent == "reply"
                    && let Some(message_id) = Self::thread_message_id(request)
                {
                    body["reply_parameters"] = json!({"message_id": message_id});
                }
                debug!(chat_id, intent, "sending telegram message");
                self.call("sendMessage", body).await?
            }
        };

        let message_id = payload
            .pointer("/result/message_id")
            .and_then(Value::as_i64)
            .map_or_else(|| "unknown".to_owned(), |id| id.to_string());
        Ok(ProviderReceipt {
            provider_message_id: format!("telegram:{message_id}"),
            raw: payload,
        })
    }
}
