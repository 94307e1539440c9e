use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use butlers_contracts::RouteEnvelope;

/// Lifecycle position of a route inbox row.
///
/// `Processed` and `Errored` are terminal and write-once; re-marking a
/// terminal row is a no-op at the store layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Accepted,
    Processing,
    Processed,
    Errored,
}

impl LifecycleState {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Errored => "errored",
        }
    }

    /// Whether this state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Errored)
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "errored" => Ok(Self::Errored),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable queue entry.
///
/// The envelope is immutable after insert; only the lifecycle state,
/// timestamps, session link, and error text ever change.
#[derive(Debug, Clone)]
pub struct InboxRow {
    pub id: Uuid,
    pub envelope: RouteEnvelope,
    pub lifecycle_state: LifecycleState,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Session created for this row, once dispatch succeeded.
    pub session_id: Option<Uuid>,
    pub error_text: Option<String>,
}
