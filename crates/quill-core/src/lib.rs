//! # quill-core
//!
//! Shared building blocks for the Quill agent server: branded ID newtypes,
//! the LLM message/content model that every subsystem persists and streams,
//! the capability seams to the LLM client and tool implementations, logging
//! initialization, and configuration-path resolution.

pub mod ids;
pub mod logging;
pub mod message;
pub mod paths;
pub mod service;

pub use ids::{ConversationId, MessageId};
pub use message::{ContentBlock, LlmMessage, Role, Usage};
pub use service::{
    CompletionRequest, CompletionResponse, LlmProvider, LlmService, ServiceError, ToolCall,
    ToolOutput, ToolSet,
};
