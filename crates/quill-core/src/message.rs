//! The LLM message model.
//!
//! [`LlmMessage`] is the shape persisted in a message row's `llm_data` blob
//! and exchanged with the LLM service. Content is a list of typed blocks;
//! the `type` tag on the wire matches the provider's block names
//! (`text`, `thinking`, `tool_use`, `tool_result`, `image`).
//!
//! An assistant message with no `tool_use` block ends the turn; the
//! `end_of_turn` flag records that decision at creation time so viewers and
//! the working-state computation never have to re-derive it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message author role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// End user or tool results fed back to the model.
    User,
    /// The model.
    Assistant,
}

/// One typed content block within a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Extended-thinking text.
    Thinking {
        /// The thinking text.
        thinking: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Provider-assigned invocation ID.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input as raw JSON.
        input: Value,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// The `ToolUse` id this result answers.
        tool_use_id: String,
        /// Result content blocks.
        content: Vec<ContentBlock>,
        /// Whether the tool reported an error.
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
    /// An inline image (base64).
    Image {
        /// Media type, e.g. `image/png`.
        media_type: String,
        /// Base64-encoded image data.
        data: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A complete message exchanged with the LLM.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// Author role.
    pub role: Role,
    /// Ordered content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// True iff this assistant message ends the turn (no tool invocations).
    #[serde(default, skip_serializing_if = "is_false")]
    pub end_of_turn: bool,
}

impl LlmMessage {
    /// A user message holding a single text block.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            end_of_turn: false,
        }
    }

    /// An empty message with the given role, to be filled block by block.
    #[must_use]
    pub fn empty(role: Role) -> Self {
        Self {
            role,
            content: Vec::new(),
            end_of_turn: false,
        }
    }

    /// Whether any content block is a tool invocation.
    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, ContentBlock::ToolUse { .. }))
    }

    /// All text blocks joined with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        let texts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect();
        texts.join("\n")
    }
}

/// Token accounting reported by the LLM service for one response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from prompt cache.
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Tokens written to prompt cache.
    #[serde(default)]
    pub cache_creation_tokens: u64,
}

impl Usage {
    /// Tokens currently occupying the context window.
    #[must_use]
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.output_tokens
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_wire_tags() {
        let block = ContentBlock::text("hi");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");

        let block = ContentBlock::ToolUse {
            id: "toolu_1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "bash");
    }

    #[test]
    fn tool_result_is_error_omitted_when_false() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "toolu_1".into(),
            content: vec![ContentBlock::text("ok")],
            is_error: false,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert!(json.get("is_error").is_none());
    }

    #[test]
    fn end_of_turn_omitted_when_false() {
        let msg = LlmMessage::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("end_of_turn").is_none());

        let msg = LlmMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::text("done")],
            end_of_turn: true,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["end_of_turn"], true);
    }

    #[test]
    fn has_tool_use() {
        let mut msg = LlmMessage::empty(Role::Assistant);
        assert!(!msg.has_tool_use());
        msg.content.push(ContentBlock::ToolUse {
            id: "t1".into(),
            name: "bash".into(),
            input: Value::Null,
        });
        assert!(msg.has_tool_use());
    }

    #[test]
    fn text_joins_text_blocks() {
        let msg = LlmMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("one"),
                ContentBlock::Thinking {
                    thinking: "hmm".into(),
                },
                ContentBlock::text("two"),
            ],
            end_of_turn: true,
        };
        assert_eq!(msg.text(), "one\ntwo");
    }

    #[test]
    fn serde_roundtrip() {
        let msg = LlmMessage {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_9".into(),
                content: vec![ContentBlock::text("output")],
                is_error: true,
            }],
            end_of_turn: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: LlmMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn usage_context_tokens() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 20,
            cache_read_tokens: 400,
            cache_creation_tokens: 0,
        };
        assert_eq!(usage.context_tokens(), 520);
    }
}
