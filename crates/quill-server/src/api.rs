//! HTTP wire types and the agent-working computation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use quill_store::{ConversationRow, MessageRow};

/// A message as sent to viewers. The four payloads are parsed JSON so
/// they embed as objects rather than re-encoded strings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    /// Message ID.
    pub message_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Per-conversation sequence.
    pub sequence_id: i64,
    /// Type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// End-of-turn flag from the LLM payload; present only when true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_of_turn: Option<bool>,
    /// LLM content payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_data: Option<Value>,
    /// User-visible payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
    /// Token-usage payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_data: Option<Value>,
    /// Tool-specific display payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
    /// Creation timestamp.
    pub created_at: String,
}

fn parse_blob(blob: Option<&String>) -> Option<Value> {
    blob.and_then(|raw| serde_json::from_str(raw).ok())
}

/// Convert a stored row to its wire shape.
#[must_use]
pub fn to_api_message(row: &MessageRow) -> ApiMessage {
    let llm_data = parse_blob(row.llm_data.as_ref());
    let end_of_turn = llm_data
        .as_ref()
        .and_then(|v| v.get("end_of_turn"))
        .and_then(Value::as_bool);
    ApiMessage {
        message_id: row.message_id.clone(),
        conversation_id: row.conversation_id.clone(),
        sequence_id: row.sequence_id,
        message_type: row.message_type.clone(),
        end_of_turn,
        llm_data,
        user_data: parse_blob(row.user_data.as_ref()),
        usage_data: parse_blob(row.usage_data.as_ref()),
        display_data: parse_blob(row.display_data.as_ref()),
        created_at: row.created_at.clone(),
    }
}

/// Convert a batch of rows.
#[must_use]
pub fn to_api_messages(rows: &[MessageRow]) -> Vec<ApiMessage> {
    rows.iter().map(to_api_message).collect()
}

/// A conversation as sent to viewers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConversation {
    /// Conversation ID.
    pub conversation_id: String,
    /// Optional slug.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Parent conversation for sub-agents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_conversation_id: Option<String>,
    /// Archived flag.
    pub archived: bool,
    /// Creation timestamp.
    pub created_at: String,
}

impl From<&ConversationRow> for ApiConversation {
    fn from(row: &ConversationRow) -> Self {
        Self {
            conversation_id: row.conversation_id.clone(),
            slug: row.slug.clone(),
            cwd: row.cwd.clone(),
            parent_conversation_id: row.parent_conversation_id.clone(),
            archived: row.archived,
            created_at: row.created_at.clone(),
        }
    }
}

/// Live turn state embedded in stream frames.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConversationState {
    /// Whether a turn is in flight.
    pub agent_working: bool,
}

/// One SSE frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StreamFrame {
    /// New messages, in sequence order.
    #[serde(default)]
    pub messages: Vec<ApiMessage>,
    /// Live turn state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_state: Option<ConversationState>,
    /// The model's context window; only on the initial snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<u64>,
    /// Set on frames that only confirm liveness.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub heartbeat: bool,
    /// The conversation record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ApiConversation>,
}

/// Decide whether the agent is working from an ordered message list:
/// strip trailing `gitinfo` entries, then the last remaining message
/// decides — an end-of-turn `agent` or an `error` means idle, anything
/// else (tool, non-end-of-turn agent, bare user) means working. Empty
/// means idle.
#[must_use]
pub fn agent_working(messages: &[ApiMessage]) -> bool {
    let mut end = messages.len();
    while end > 0 && messages[end - 1].message_type == "gitinfo" {
        end -= 1;
    }
    let Some(last) = messages[..end].last() else {
        return false;
    };
    match last.message_type.as_str() {
        "agent" => last.end_of_turn != Some(true),
        "error" => false,
        _ => true,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
