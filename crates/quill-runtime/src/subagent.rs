//! The pluggable sub-agent runner.
//!
//! Tools spawn sub-agents through [`SubagentRunner`]: accept a prompt into
//! a (usually child) conversation, optionally wait for the turn to finish,
//! and return the agent's final text. The native implementation polls the
//! conversation's working flag; an external-CLI deployment can substitute
//! its own runner behind the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use quill_core::{LlmMessage, LlmProvider};
use quill_store::Store;

use crate::errors::{Result, RuntimeError};
use crate::registry::ConversationRegistry;

/// How often the native runner polls the working flag.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs a prompt in a sub-agent conversation.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    /// Accept `prompt` into `conversation_id` and, when `wait` is set,
    /// block until the turn completes or `timeout` elapses. Returns the
    /// agent's final text, or a status line when not waiting.
    async fn run_subagent(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        prompt: &str,
        wait: bool,
        timeout: Duration,
    ) -> Result<String>;
}

/// Native runner: drives the conversation's own turn loop and polls its
/// working flag until idle.
pub struct NativeSubagentRunner {
    registry: Arc<ConversationRegistry>,
    store: Arc<Store>,
    provider: Arc<dyn LlmProvider>,
    default_model: String,
}

impl NativeSubagentRunner {
    /// Build a runner over the registry and store.
    #[must_use]
    pub fn new(
        registry: Arc<ConversationRegistry>,
        store: Arc<Store>,
        provider: Arc<dyn LlmProvider>,
        default_model: String,
    ) -> Self {
        Self {
            registry,
            store,
            provider,
            default_model,
        }
    }

    /// Text of the latest agent-produced message, or `None` while the
    /// conversation still ends on the user's own prompt (the driver may
    /// not have picked it up yet).
    fn finished_text(&self, conversation_id: &str) -> Result<Option<String>> {
        let Some(row) = self.store.latest_message(conversation_id)? else {
            return Ok(None);
        };
        if row.message_type == "user" {
            return Ok(None);
        }
        let Some(llm_data) = row.llm_data else {
            return Ok(Some(String::new()));
        };
        let message: LlmMessage = serde_json::from_str(&llm_data)?;
        Ok(Some(message.text()))
    }
}

#[async_trait]
impl SubagentRunner for NativeSubagentRunner {
    #[instrument(skip(self, cancel, prompt), fields(conversation_id, wait))]
    async fn run_subagent(
        &self,
        cancel: &CancellationToken,
        conversation_id: &str,
        prompt: &str,
        wait: bool,
        timeout: Duration,
    ) -> Result<String> {
        let manager = self.registry.get_or_create(conversation_id)?;
        let service = self.provider.service(&self.default_model)?;

        manager
            .accept_user_message(
                Some(service),
                &self.default_model,
                LlmMessage::user_text(prompt),
            )
            .await?;

        if !wait {
            return Ok(format!(
                "Subagent started processing. Conversation ID: {conversation_id}"
            ));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(
                    "Subagent is still working (timeout reached). Send another message to check \
                     status."
                        .to_owned(),
                );
            }
            if !manager.is_agent_working() {
                if let Some(text) = self.finished_text(conversation_id)? {
                    return Ok(text);
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            manager.touch();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{standard_record_fn, ManagerConfig, StreamUpdate};
    use crate::registry::ManagerFactory;
    use quill_core::{
        CompletionRequest, CompletionResponse, ContentBlock, LlmService, Role, ServiceError, Usage,
    };
    use quill_subpub::SubPub;

    struct EchoService;

    #[async_trait]
    impl LlmService for EchoService {
        async fn complete(
            &self,
            _cancel: &CancellationToken,
            request: &CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ServiceError> {
            let last = request
                .messages
                .last()
                .map(LlmMessage::text)
                .unwrap_or_default();
            Ok(CompletionResponse {
                message: LlmMessage {
                    role: Role::Assistant,
                    content: vec![ContentBlock::text(format!("echo: {last}"))],
                    end_of_turn: false,
                },
                usage: Usage::default(),
            })
        }

        fn token_context_window(&self) -> u64 {
            8192
        }
    }

    struct EchoProvider;

    impl LlmProvider for EchoProvider {
        fn service(
            &self,
            _model_id: &str,
        ) -> std::result::Result<Arc<dyn LlmService>, ServiceError> {
            Ok(Arc::new(EchoService))
        }
    }

    fn setup() -> (
        tempfile::TempDir,
        Arc<Store>,
        Arc<ConversationRegistry>,
        NativeSubagentRunner,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open(&quill_store::PoolConfig::new(dir.path().join("test.db"))).unwrap(),
        );
        store.migrate().unwrap();

        let factory_store = store.clone();
        let factory: ManagerFactory = Arc::new(move |row, _registry| {
            let bus = Arc::new(SubPub::<StreamUpdate>::new());
            let record = standard_record_fn(
                factory_store.clone(),
                bus.clone(),
                row.conversation_id.clone(),
            );
            Ok(crate::manager::ConversationManager::new(
                ManagerConfig::new(&row.conversation_id, "/tmp"),
                factory_store.clone(),
                bus,
                record,
            ))
        });
        let registry =
            ConversationRegistry::new(store.clone(), factory, Duration::from_secs(60));
        let runner = NativeSubagentRunner::new(
            registry.clone(),
            store.clone(),
            Arc::new(EchoProvider),
            "echo-model".into(),
        );
        (dir, store, registry, runner)
    }

    #[tokio::test]
    async fn no_wait_returns_immediately() {
        let (_dir, store, _registry, runner) = setup();
        let conv = store.create_conversation(None, true, None).unwrap();

        let result = runner
            .run_subagent(
                &CancellationToken::new(),
                &conv.conversation_id,
                "do the thing",
                false,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.contains(&conv.conversation_id));
    }

    #[tokio::test]
    async fn wait_returns_final_text() {
        let (_dir, store, _registry, runner) = setup();
        let conv = store.create_conversation(None, true, None).unwrap();

        let result = runner
            .run_subagent(
                &CancellationToken::new(),
                &conv.conversation_id,
                "ping",
                true,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result, "echo: ping");
    }

    #[tokio::test]
    async fn unknown_conversation_fails() {
        let (_dir, _store, _registry, runner) = setup();
        let err = runner
            .run_subagent(
                &CancellationToken::new(),
                "cmissing",
                "hello",
                true,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conversation not found"));
    }
}
