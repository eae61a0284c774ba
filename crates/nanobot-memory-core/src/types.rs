use crate::sanitize::SanitizedId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
    #[serde(other)]
    Other,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn is_conversational(self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_sync: bool,
}

impl HistoryEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            pending_sync: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl RemoteMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: None,
        }
    }
}

impl From<&HistoryEntry> for RemoteMessage {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            role: entry.role,
            content: entry.content.clone(),
            created_at: entry.timestamp.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    id: SanitizedId,
    observe_me: bool,
    observe_others: bool,
}

impl Peer {
    #[must_use]
    pub fn user(id: SanitizedId) -> Self {
        Self {
            id,
            observe_me: true,
            observe_others: true,
        }
    }

    #[must_use]
    pub fn assistant(id: SanitizedId) -> Self {
        Self {
            id,
            observe_me: false,
            observe_others: true,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SanitizedId {
        &self.id
    }

    #[must_use]
    pub fn observe_me(&self) -> bool {
        self.observe_me
    }

    #[must_use]
    pub fn observe_others(&self) -> bool {
        self.observe_others
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteSession {
    id: SanitizedId,
    user: Peer,
    assistant: Peer,
}

impl RemoteSession {
    #[must_use]
    pub fn new(id: SanitizedId, user: Peer, assistant: Peer) -> Self {
        Self {
            id,
            user,
            assistant,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SanitizedId {
        &self.id
    }

    #[must_use]
    pub fn user(&self) -> &Peer {
        &self.user
    }

    #[must_use]
    pub fn assistant(&self) -> &Peer {
        &self.assistant
    }

    #[must_use]
    pub fn peer_for(&self, role: Role) -> &Peer {
        match role {
            Role::Assistant => &self.assistant,
            _ => &self.user,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionContext {
    pub summary: Option<String>,
    pub messages: Vec<RemoteMessage>,
    pub representation: Option<String>,
    pub peer_card: Vec<String>,
}

impl SessionContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.as_deref().is_none_or(|s| s.trim().is_empty())
            && self.messages.is_empty()
            && self
                .representation
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
            && self.peer_card.iter().all(|line| line.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub key: String,
    pub migrated: bool,
    pub cursor: usize,
    pub migrated_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum MigrationOutcome {
    Migrated { count: usize },
    Skipped,
    Failed { reason: String },
}

impl MigrationOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrated { .. } => "migrated",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unresolved,
    Migrating,
    Active,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Remote,
    LocalFallback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Prefetch,
    QueryUserContext,
}
