//! Row types for conversations, messages and memory entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned conversation identifier.
pub type ConversationId = i64;

/// Author of a stored message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

impl Role {
    /// Stable string form for storage and the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// Conversation metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    /// Store-assigned id.
    pub id: ConversationId,
    /// Unique display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last appended message.
    pub updated_at: DateTime<Utc>,
}

/// A stored chat message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Row id; insertion order.
    pub id: i64,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Insertion time.
    pub timestamp: DateTime<Utc>,
}

/// A long-term memory fact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Row id; insertion order.
    pub id: i64,
    /// The remembered fact.
    pub content: String,
    /// Free-form category, `general` by default.
    pub category: String,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Default memory category.
pub const DEFAULT_MEMORY_CATEGORY: &str = "general";

/// Result of `PRAGMA integrity_check`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IntegrityReport {
    /// The database reported `ok`.
    Ok,
    /// The database reported problems; one line per finding.
    Problems(Vec<String>),
}

impl IntegrityReport {
    /// Whether the check passed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}
