//! Database row types.
//!
//! Raw row shapes for the `conversations` and `messages` tables. The HTTP
//! wire types live in the server crate; conversion happens there.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// End-user input (or tool results in an external-CLI stream).
    User,
    /// Assistant output.
    Agent,
    /// Tool results produced by the native loop.
    Tool,
    /// Server-generated informational message.
    System,
    /// Failure surfaced to the viewer; ends the turn.
    Error,
    /// Repository status snapshot; informational, never affects turn state.
    #[serde(rename = "gitinfo")]
    GitInfo,
}

impl MessageType {
    /// The tag stored in the `type` column.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::System => "system",
            Self::Error => "error",
            Self::GitInfo => "gitinfo",
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw row from the `conversations` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    /// Conversation ID.
    pub conversation_id: String,
    /// Optional human-readable slug, unique among siblings.
    pub slug: Option<String>,
    /// Whether a user (vs. a tool) opened the conversation.
    pub user_initiated: bool,
    /// Working directory reported to tools.
    pub cwd: Option<String>,
    /// Parent conversation for sub-agents.
    pub parent_conversation_id: Option<String>,
    /// Archived flag.
    pub archived: bool,
    /// Creation timestamp.
    pub created_at: String,
}

impl ConversationRow {
    pub(crate) const COLUMNS: &'static str = "conversation_id, slug, user_initiated, cwd, \
         parent_conversation_id, archived, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            slug: row.get(1)?,
            user_initiated: row.get(2)?,
            cwd: row.get(3)?,
            parent_conversation_id: row.get(4)?,
            archived: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

/// Raw row from the `messages` table. The four data columns are opaque
/// JSON text from the store's perspective.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Message ID (UUID).
    pub message_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Per-conversation monotonic sequence, assigned at creation.
    pub sequence_id: i64,
    /// Type tag (`user`, `agent`, `tool`, `system`, `error`, `gitinfo`).
    #[serde(rename = "type")]
    pub message_type: String,
    /// LLM content payload.
    pub llm_data: Option<String>,
    /// User-visible payload.
    pub user_data: Option<String>,
    /// Token-usage payload.
    pub usage_data: Option<String>,
    /// Tool-specific display payload.
    pub display_data: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

impl MessageRow {
    pub(crate) const COLUMNS: &'static str = "message_id, conversation_id, sequence_id, type, \
         llm_data, user_data, usage_data, display_data, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            conversation_id: row.get(1)?,
            sequence_id: row.get(2)?,
            message_type: row.get(3)?,
            llm_data: row.get(4)?,
            user_data: row.get(5)?,
            usage_data: row.get(6)?,
            display_data: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    /// Whether this row has the given type tag.
    #[must_use]
    pub fn is_type(&self, message_type: MessageType) -> bool {
        self.message_type == message_type.as_str()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_tags() {
        assert_eq!(MessageType::User.as_str(), "user");
        assert_eq!(MessageType::GitInfo.as_str(), "gitinfo");
        assert_eq!(
            serde_json::to_string(&MessageType::GitInfo).unwrap(),
            "\"gitinfo\""
        );
    }

    #[test]
    fn is_type() {
        let row = MessageRow {
            message_id: "m1".into(),
            conversation_id: "c1".into(),
            sequence_id: 1,
            message_type: "agent".into(),
            llm_data: None,
            user_data: None,
            usage_data: None,
            display_data: None,
            created_at: String::new(),
        };
        assert!(row.is_type(MessageType::Agent));
        assert!(!row.is_type(MessageType::Tool));
    }
}
