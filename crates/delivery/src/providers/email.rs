use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{ChannelProvider, ProviderReceipt};
use crate::error::{ErrorClass, ProviderSendError};
use crate::request::DeliveryRequestRow;

/// SMTP connection settings for the email provider.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Sender address for outbound mail.
    pub from: String,
}

/// SMTP email provider (lettre, async).
///
/// Transport errors map to `transient_network`, SMTP permanent rejections
/// (5xx) to `permanent_validation`, transient rejections (4xx) to
/// `provider_error`.
pub struct EmailProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailProvider {
    /// Build a provider over an implicit-TLS SMTP relay.
    pub fn new(config: &SmtpConfig) -> Result<Self, ProviderSendError> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            ProviderSendError::new(
                ErrorClass::PermanentValidation,
                format!("invalid from address '{}': {e}", config.from),
            )
        })?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| {
                ProviderSendError::new(
                    ErrorClass::PermanentValidation,
                    format!("invalid SMTP relay '{}': {e}", config.host),
                )
            })?
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn name(&self) -> &str {
        "smtp"
    }

    fn channel(&self) -> &str {
        "email"
    }

    async fn send(
        &self,
        request: &DeliveryRequestRow,
    ) -> Result<ProviderReceipt, ProviderSendError> {
        let recipient = request.target_identity.as_deref().ok_or_else(|| {
            ProviderSendError::new(
                ErrorClass::PermanentValidation,
                "email delivery requires a recipient address",
            )
        })?;
        let to: Mailbox = recipient.parse().map_err(|e| {
            ProviderSendError::new(
                ErrorClass::PermanentValidation,
                format!("invalid recipient '{recipient}': {e}"),
            )
        })?;

        let subject = request.subject.clone().unwrap_or_else(|| {
            // Butlers occasionally send subject-less notes; keep them
            // deliverable.
            "(no subject)".to_owned()
        });
        let message_id = format!("<{}@butlers>", Uuid::now_v7());
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&subject)
            .message_id(Some(message_id.clone()))
            .body(request.message_content.clone())
            .map_err(|e| {
                ProviderSendError::new(
                    ErrorClass::PermanentValidation,
                    format!("failed to build message: {e}"),
                )
            })?;

        debug!(recipient, subject = %subject, "sending email");
        let response = self.transport.send(message).await.map_err(|e| {
            let class = if e.is_permanent() {
                ErrorClass::PermanentValidation
            } else if e.is_transient() {
                ErrorClass::ProviderError
            } else {
                ErrorClass::TransientNetwork
            };
            ProviderSendError::new(class, e.to_string())
        })?;

        Ok(ProviderReceipt {
            provider_message_id: message_id,
            raw: json!({
                "code": response.code().to_string(),
                "message": response.message().collect::<Vec<_>>().join(" "),
            }),
        })
    }
}
