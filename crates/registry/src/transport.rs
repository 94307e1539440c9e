use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from a butler-to-butler tool call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("target returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    InvalidResponse(String),
}

/// Transport for invoking a tool on another butler's endpoint.
#[async_trait]
pub trait ButlerTransport: Send + Sync {
    /// Call `tool` on the butler at `endpoint_url` with JSON `args`,
    /// returning the tool's JSON result.
    async fn call_tool(
        &self,
        endpoint_url: &str,
        tool: &str,
        args: &Value,
    ) -> Result<Value, TransportError>;
}

/// HTTP transport: POSTs `args` to `{endpoint_url}/tools/{tool}`.
pub struct HttpButlerTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpButlerTransport {
    /// Build a transport with the given per-call timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client, timeout }
    }
}

impl Default for HttpButlerTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ButlerTransport for HttpButlerTransport {
    async fn call_tool(
        &self,
        endpoint_url: &str,
        tool: &str,
        args: &Value,
    ) -> Result<Value, TransportError> {
        let url = format!("{}/tools/{tool}", endpoint_url.trim_end_matches('/'));
        debug!(%url, "calling butler tool");

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TransportError::Status {
            status: 503,
            body: "draining".into(),
        };
        assert_eq!(err.to_string(), "target returned status 503: draining");
    }
}
