//! Capability seams to external collaborators.
//!
//! The LLM HTTP client and the tool implementations live outside the core;
//! the core talks to them exclusively through these traits. [`LlmService`]
//! is one model endpoint, [`LlmProvider`] resolves model IDs to services,
//! and [`ToolSet`] dispatches a tool invocation and owns whatever resources
//! the tools hold (subprocesses, browser handles).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::{ContentBlock, LlmMessage, Usage};

/// Errors surfaced by LLM service implementations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No service is registered for the requested model ID.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,

    /// Transport or provider failure, already formatted for display.
    #[error("llm request failed: {0}")]
    Request(String),
}

/// One completion request against a model.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    /// Model to use.
    pub model_id: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Full conversation history, oldest first.
    pub messages: Vec<LlmMessage>,
}

/// The model's answer to a [`CompletionRequest`].
#[derive(Clone, Debug)]
pub struct CompletionResponse {
    /// The assistant message. `end_of_turn` is left for the caller to set
    /// from the presence of tool invocations.
    pub message: LlmMessage,
    /// Token accounting for this response.
    pub usage: Usage,
}

/// A single LLM model endpoint.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Run one completion. Implementations must return promptly with
    /// [`ServiceError::Cancelled`] when `cancel` fires.
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ServiceError>;

    /// The model's context window, in tokens.
    fn token_context_window(&self) -> u64;
}

/// Resolves model IDs to services.
pub trait LlmProvider: Send + Sync {
    /// Look up the service for a model ID.
    ///
    /// # Errors
    ///
    /// [`ServiceError::UnknownModel`] when no service is registered.
    fn service(&self, model_id: &str) -> Result<Arc<dyn LlmService>, ServiceError>;
}

/// A tool invocation extracted from an assistant message.
#[derive(Clone, Debug)]
pub struct ToolCall {
    /// Provider-assigned invocation ID.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool input as raw JSON.
    pub input: Value,
}

/// The outcome of dispatching one [`ToolCall`].
#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    /// Result content fed back to the model.
    pub content: Vec<ContentBlock>,
    /// Whether the tool reported an error.
    pub is_error: bool,
    /// Optional tool-specific display payload for viewers.
    pub display: Option<Value>,
}

/// A bundle of tools bound to one conversation.
#[async_trait]
pub trait ToolSet: Send + Sync {
    /// The working directory tools operate in.
    fn working_dir(&self) -> PathBuf;

    /// Dispatch one invocation. Implementations must observe `cancel` and
    /// abandon in-flight work promptly when it fires.
    async fn invoke(&self, cancel: &CancellationToken, call: &ToolCall) -> ToolOutput;

    /// Release held resources. Called once on conversation eviction.
    fn release(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_display() {
        let err = ServiceError::UnknownModel("gpt-oss".into());
        assert_eq!(err.to_string(), "unknown model: gpt-oss");
    }

    #[test]
    fn cancelled_display() {
        assert_eq!(ServiceError::Cancelled.to_string(), "request cancelled");
    }

    #[test]
    fn tool_output_default_is_empty_success() {
        let out = ToolOutput::default();
        assert!(out.content.is_empty());
        assert!(!out.is_error);
        assert!(out.display.is_none());
    }
}
