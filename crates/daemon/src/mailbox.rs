use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::daemon::DaemonError;

/// One message in a butler's mailbox.
#[derive(Debug, Clone)]
pub struct MailboxMessage {
    pub id: Uuid,
    pub sender: String,
    pub sender_channel: String,
    pub body: String,
    pub subject: Option<String>,
    pub priority: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only mailbox storage, enabled by the `mailbox` module.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Append a message; returns its id.
    async fn post(&self, message: MailboxMessage) -> Result<Uuid, DaemonError>;

    /// Most recent messages, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<MailboxMessage>, DaemonError>;
}

/// In-memory mailbox for tests and development.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    messages: std::sync::Mutex<Vec<MailboxMessage>>,
}

impl MemoryMailbox {
    /// Create a new, empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MailboxStore for MemoryMailbox {
    async fn post(&self, message: MailboxMessage) -> Result<Uuid, DaemonError> {
        let id = message.id;
        self.messages
            .lock()
            .expect("mailbox mutex poisoned")
            .push(message);
        Ok(id)
    }

    async fn list(&self, limit: usize) -> Result<Vec<MailboxMessage>, DaemonError> {
        let messages = self.messages.lock().expect("mailbox mutex poisoned");
        Ok(messages.iter().rev().take(limit).cloned().collect())
    }
}

/// PostgreSQL mailbox over the butler's `mailbox` table.
pub struct PostgresMailbox {
    pool: PgPool,
    table: String,
}

impl PostgresMailbox {
    /// Build a mailbox on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, DaemonError> {
        let table = format!("{schema}.mailbox");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                sender TEXT NOT NULL,
                sender_channel TEXT NOT NULL,
                body TEXT NOT NULL,
                subject TEXT,
                priority TEXT,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        sqlx::query(&create)
            .execute(&pool)
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl MailboxStore for PostgresMailbox {
    async fn post(&self, message: MailboxMessage) -> Result<Uuid, DaemonError> {
        let query = format!(
            "INSERT INTO {} (id, sender, sender_channel, body, subject, priority, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );
        sqlx::query(&query)
            .bind(message.id)
            .bind(&message.sender)
            .bind(&message.sender_channel)
            .bind(&message.body)
            .bind(&message.subject)
            .bind(&message.priority)
            .bind(&message.metadata)
            .execute(&self.pool)
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))?;
        Ok(message.id)
    }

    async fn list(&self, limit: usize) -> Result<Vec<MailboxMessage>, DaemonError> {
        let query = format!(
            "SELECT id, sender, sender_channel, body, subject, priority, metadata, created_at \
             FROM {} ORDER BY created_at DESC LIMIT $1",
            self.table
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| MailboxMessage {
                id: row.get("id"),
                sender: row.get("sender"),
                sender_channel: row.get("sender_channel"),
                body: row.get("body"),
                subject: row.get("subject"),
                priority: row.get("priority"),
                metadata: row.get("metadata"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_mailbox_lists_newest_first() {
        let mailbox = MemoryMailbox::new();
        for i in 0..3 {
            mailbox
                .post(MailboxMessage {
                    id: Uuid::now_v7(),
                    sender: "finance".into(),
                    sender_channel: "internal".into(),
                    body: format!("note {i}"),
                    subject: None,
                    priority: None,
                    metadata: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let listed = mailbox.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].body, "note 2");
    }
}
