//! Turn-loop drivers.
//!
//! A [`TurnLoop`] is the message-producing capability bundle behind a
//! conversation manager: queue a user message, expose loop history, and
//! `go` — the driver task that runs until its context is cancelled. The
//! [`NativeTurnLoop`] here drives the in-process LLM service and tool
//! dispatch; the external-CLI variant lives in [`crate::external`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use quill_core::{
    CompletionRequest, ContentBlock, LlmMessage, LlmService, Role, ToolCall,
};
use quill_store::MessageType;

use crate::errors::{Result, RuntimeError};
use crate::manager::{ConversationManager, RecordRequest};

/// User messages buffered into a driver before enqueue blocks the caller.
pub const USER_MESSAGE_QUEUE: usize = 100;

/// The message-producing capability bundle of a conversation.
#[async_trait]
pub trait TurnLoop: Send + Sync {
    /// Enqueue a user message for the driver. Blocks when the queue is
    /// full — implicit backpressure on the caller.
    async fn queue_user_message(&self, message: LlmMessage);

    /// Copy of the loop's message history.
    fn history(&self) -> Vec<LlmMessage>;

    /// The driver: process queued messages until `cancel` fires.
    async fn go(&self, cancel: CancellationToken);
}

/// The in-process LLM turn loop.
///
/// For each queued user message: set the working flag, call the LLM,
/// record the assistant message, dispatch any requested tools, record the
/// results, and repeat until the assistant ends the turn or the iteration
/// cap is reached. The flag is cleared on every exit path; cancellation
/// terminates the turn without recording partial output.
pub struct NativeTurnLoop {
    manager: Arc<ConversationManager>,
    service: Arc<dyn LlmService>,
    model_id: String,
    inbox_tx: mpsc::Sender<LlmMessage>,
    inbox_rx: tokio::sync::Mutex<Option<mpsc::Receiver<LlmMessage>>>,
    history: Mutex<Vec<LlmMessage>>,
}

impl NativeTurnLoop {
    /// Build a driver bound to `manager` and one LLM service.
    #[must_use]
    pub fn new(
        manager: Arc<ConversationManager>,
        service: Arc<dyn LlmService>,
        model_id: String,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(USER_MESSAGE_QUEUE);
        Arc::new(Self {
            manager,
            service,
            model_id,
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(Some(inbox_rx)),
            history: Mutex::new(Vec::new()),
        })
    }

    async fn process_message(&self, cancel: &CancellationToken, message: LlmMessage) {
        self.manager.set_agent_working(true);
        let outcome = self.run_turns(cancel, message).await;
        self.manager.set_agent_working(false);

        match outcome {
            Ok(()) => {}
            Err(RuntimeError::Cancelled) => {
                debug!(
                    conversation_id = %self.manager.conversation_id(),
                    "turn cancelled"
                );
            }
            Err(e) => {
                error!(
                    conversation_id = %self.manager.conversation_id(),
                    error = %e,
                    "turn loop processing error"
                );
            }
        }
    }

    async fn run_turns(&self, cancel: &CancellationToken, message: LlmMessage) -> Result<()> {
        self.history.lock().push(message);

        for iteration in 0..self.manager.max_iterations() {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let request = CompletionRequest {
                model_id: self.model_id.clone(),
                system_prompt: None,
                messages: self.history.lock().clone(),
            };

            let response = match self.service.complete(cancel, &request).await {
                Ok(r) => r,
                Err(quill_core::ServiceError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(e) => {
                    self.record_error(&e.to_string());
                    return Ok(());
                }
            };

            let mut assistant = response.message;
            assistant.role = Role::Assistant;
            assistant.end_of_turn = !assistant.has_tool_use();

            self.manager.record_message(&RecordRequest {
                message_type: MessageType::Agent,
                llm_message: Some(assistant.clone()),
                usage: Some(response.usage),
                ..Default::default()
            })?;
            self.history.lock().push(assistant.clone());

            if assistant.end_of_turn {
                return Ok(());
            }

            let tool_message = self.dispatch_tools(cancel, &assistant).await?;
            self.history.lock().push(tool_message);

            debug!(
                conversation_id = %self.manager.conversation_id(),
                iteration,
                "turn iteration complete"
            );
        }

        info!(
            conversation_id = %self.manager.conversation_id(),
            max_iterations = self.manager.max_iterations(),
            "turn reached iteration cap"
        );
        self.record_error("turn reached the maximum iteration count");
        Ok(())
    }

    /// Dispatch every tool invocation in `assistant` sequentially and
    /// record the combined results as one `tool` message. Cancellation is
    /// honored at every tool boundary; a cancelled turn records nothing.
    async fn dispatch_tools(
        &self,
        cancel: &CancellationToken,
        assistant: &LlmMessage,
    ) -> Result<LlmMessage> {
        let calls: Vec<ToolCall> = assistant
            .content
            .iter()
            .filter_map(|c| match c {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect();

        let Some(tool_set) = self.manager.tool_set() else {
            let results = calls
                .iter()
                .map(|call| ContentBlock::ToolResult {
                    tool_use_id: call.id.clone(),
                    content: vec![ContentBlock::text("no toolset is configured")],
                    is_error: true,
                })
                .collect();
            let message = LlmMessage {
                role: Role::User,
                content: results,
                end_of_turn: false,
            };
            self.manager.record_message(&RecordRequest {
                message_type: MessageType::Tool,
                llm_message: Some(message.clone()),
                ..Default::default()
            })?;
            return Ok(message);
        };

        let mut results = Vec::with_capacity(calls.len());
        let mut displays = Vec::new();
        for call in &calls {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let output = tool_set.invoke(cancel, call).await;
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: output.content,
                is_error: output.is_error,
            });
            if let Some(display) = output.display {
                displays.push(display);
            }
        }

        let message = LlmMessage {
            role: Role::User,
            content: results,
            end_of_turn: false,
        };
        self.manager.record_message(&RecordRequest {
            message_type: MessageType::Tool,
            llm_message: Some(message.clone()),
            display_data: if displays.is_empty() {
                None
            } else {
                Some(serde_json::Value::Array(displays))
            },
            ..Default::default()
        })?;
        Ok(message)
    }

    fn record_error(&self, text: &str) {
        if let Err(e) = self.manager.record_message(&RecordRequest {
            message_type: MessageType::Error,
            user_data: Some(json!({ "error": text })),
            ..Default::default()
        }) {
            error!(
                conversation_id = %self.manager.conversation_id(),
                error = %e,
                "failed to record error message"
            );
        }
    }
}

#[async_trait]
impl TurnLoop for NativeTurnLoop {
    async fn queue_user_message(&self, message: LlmMessage) {
        let _ = self.inbox_tx.send(message).await;
    }

    fn history(&self) -> Vec<LlmMessage> {
        self.history.lock().clone()
    }

    async fn go(&self, cancel: CancellationToken) {
        let Some(mut inbox) = self.inbox_rx.lock().await.take() else {
            return;
        };
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                message = inbox.recv() => {
                    let Some(message) = message else { return };
                    self.process_message(&cancel, message).await;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
