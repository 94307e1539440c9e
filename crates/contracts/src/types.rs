use serde::{Deserialize, Serialize};

/// Channel an event was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Telegram,
    Slack,
    Email,
    Api,
    Mcp,
}

impl SourceChannel {
    /// Returns the wire string for this channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Email => "email",
            Self::Api => "api",
            Self::Mcp => "mcp",
        }
    }

    /// Providers that may legally produce events for this channel.
    #[must_use]
    pub fn allowed_providers(self) -> &'static [SourceProvider] {
        match self {
            Self::Telegram => &[SourceProvider::Telegram],
            Self::Slack => &[SourceProvider::Slack],
            Self::Email => &[SourceProvider::Imap],
            Self::Api | Self::Mcp => &[SourceProvider::Internal],
        }
    }
}

impl std::fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream provider that observed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceProvider {
    Telegram,
    Slack,
    Imap,
    Internal,
}

impl SourceProvider {
    /// Returns the wire string for this provider.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Slack => "slack",
            Self::Imap => "imap",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for SourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an outbound delivery is meant to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyIntent {
    Send,
    Reply,
    React,
}

impl NotifyIntent {
    /// Returns the wire string for this intent.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Reply => "reply",
            Self::React => "react",
        }
    }
}

impl std::fmt::Display for NotifyIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    Telegram,
    Email,
    Sms,
    Chat,
}

impl NotifyChannel {
    /// Returns the wire string for this channel.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for NotifyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling tier hint carried through ingest control metadata.
///
/// Pass-through lineage only; nothing downstream consumes it yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    #[default]
    Default,
    Interactive,
    HighPriority,
}

/// How fanned-out subrequests are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    Parallel,
    Ordered,
    Conditional,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_provider_pairs() {
        assert_eq!(
            SourceChannel::Email.allowed_providers(),
            &[SourceProvider::Imap]
        );
        assert_eq!(
            SourceChannel::Api.allowed_providers(),
            &[SourceProvider::Internal]
        );
        assert_eq!(
            SourceChannel::Mcp.allowed_providers(),
            &[SourceProvider::Internal]
        );
        assert!(
            !SourceChannel::Telegram
                .allowed_providers()
                .contains(&SourceProvider::Imap)
        );
    }

    #[test]
    fn wire_strings_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&PolicyTier::HighPriority).unwrap(),
            "\"high_priority\""
        );
        assert_eq!(
            serde_json::from_str::<FanoutMode>("\"parallel\"").unwrap(),
            FanoutMode::Parallel
        );
    }

    #[test]
    fn policy_tier_defaults() {
        assert_eq!(PolicyTier::default(), PolicyTier::Default);
    }
}
