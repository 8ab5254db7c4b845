//! LLM provider plumbing for the binary and for tests.
//!
//! Real model clients are external collaborators registered into a
//! [`StaticProvider`]. The [`PredictableService`] is a deterministic
//! stand-in (the `predictable` model): it answers every prompt with a
//! canned echo and always ends the turn, which makes full end-to-end runs
//! possible without network access or credentials.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quill_core::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmMessage, LlmProvider, LlmService, Role,
    ServiceError, Usage,
};

/// Model-ID → service registry.
#[derive(Default)]
pub struct StaticProvider {
    services: HashMap<String, Arc<dyn LlmService>>,
}

impl StaticProvider {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service` under `model_id`.
    #[must_use]
    pub fn with_service(mut self, model_id: impl Into<String>, service: Arc<dyn LlmService>) -> Self {
        let _ = self.services.insert(model_id.into(), service);
        self
    }
}

impl LlmProvider for StaticProvider {
    fn service(&self, model_id: &str) -> Result<Arc<dyn LlmService>, ServiceError> {
        self.services
            .get(model_id)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownModel(model_id.to_owned()))
    }
}

/// Deterministic echo service backing the `predictable` model.
pub struct PredictableService;

#[async_trait]
impl LlmService for PredictableService {
    async fn complete(
        &self,
        cancel: &CancellationToken,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ServiceError> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(LlmMessage::text)
            .unwrap_or_default();
        Ok(CompletionResponse {
            message: LlmMessage {
                role: Role::Assistant,
                content: vec![ContentBlock::text(format!(
                    "Predictable response to: {prompt}"
                ))],
                end_of_turn: true,
            },
            usage: Usage {
                input_tokens: prompt.len() as u64,
                output_tokens: 16,
                ..Default::default()
            },
        })
    }

    fn token_context_window(&self) -> u64 {
        8192
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn predictable_echoes_last_user_message() {
        let service = PredictableService;
        let response = service
            .complete(
                &CancellationToken::new(),
                &CompletionRequest {
                    model_id: "predictable".into(),
                    system_prompt: None,
                    messages: vec![LlmMessage::user_text("hello there")],
                },
            )
            .await
            .unwrap();
        assert_eq!(response.message.text(), "Predictable response to: hello there");
        assert!(response.message.end_of_turn);
    }

    #[tokio::test]
    async fn provider_resolves_registered_models() {
        let provider =
            StaticProvider::new().with_service("predictable", Arc::new(PredictableService));
        assert!(provider.service("predictable").is_ok());
        let err = match provider.service("gpt-nope") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.to_string(), "unknown model: gpt-nope");
    }
}
