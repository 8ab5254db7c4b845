//! The per-conversation manager.
//!
//! One [`ConversationManager`] per active conversation owns the in-memory
//! turn-loop state and the subscriber set. It holds shared references to
//! the message store and the conversation's bus; the turn loop never
//! touches the store directly — every produced message goes through the
//! record pipeline bound at construction, which persists inside a write
//! transaction, publishes the resulting row on the bus, and feeds the
//! token counters.
//!
//! Locks here guard pointer-sized state only and are never held across
//! I/O; the store has its own serialization and the bus its own.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quill_core::{LlmMessage, LlmService, ToolSet, Usage};
use quill_store::{CreateMessageParams, MessageRow, MessageType, Store};
use quill_subpub::{SubPub, Subscription};

use crate::errors::{Result, RuntimeError};
use crate::external::ExternalCliLoop;
use crate::turn_loop::{NativeTurnLoop, TurnLoop};

/// Payload published on a conversation's bus: one batch of freshly
/// persisted rows (usually one) plus the working flag at publish time.
/// Synthetic working-state transitions publish with an empty batch.
#[derive(Clone, Debug)]
pub struct StreamUpdate {
    /// Sequence ID this update was published under.
    pub sequence_id: i64,
    /// Freshly persisted rows, in sequence order.
    pub messages: Vec<MessageRow>,
    /// Working flag at publish time.
    pub agent_working: bool,
}

/// What a turn loop asks the record pipeline to persist.
#[derive(Clone, Debug, Default)]
pub struct RecordRequest {
    /// Type tag for the row.
    pub message_type: MessageType,
    /// LLM content payload.
    pub llm_message: Option<LlmMessage>,
    /// User-visible payload.
    pub user_data: Option<Value>,
    /// Token usage for this message.
    pub usage: Option<Usage>,
    /// Tool-specific display payload.
    pub display_data: Option<Value>,
}

/// The record pipeline: persist → publish. Bound at construction so the
/// manager has no lifetime dependency on the server beyond this closure.
/// The second argument is the working flag at record time, folded into the
/// published update.
pub type RecordFn =
    Arc<dyn Fn(&RecordRequest, bool) -> Result<MessageRow> + Send + Sync>;

/// Factory materializing a child conversation manager for a sub-agent:
/// `(slug, parent_conversation_id, cwd)`.
pub type SubagentBridge =
    Arc<dyn Fn(&str, &str, &Path) -> Result<Arc<ConversationManager>> + Send + Sync>;

/// Factory building the conversation's toolset on first use.
pub type ToolSetFactory = Arc<dyn Fn(&Path) -> Arc<dyn ToolSet> + Send + Sync>;

/// Which turn-loop variant drives the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopBackend {
    /// The in-process LLM loop.
    Native,
    /// The external `claude` CLI.
    ExternalCli,
}

/// Construction-time settings for a manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// The conversation this manager owns.
    pub conversation_id: String,
    /// Working directory reported to tools.
    pub cwd: PathBuf,
    /// MCP endpoint advertised to the external CLI.
    pub mcp_url: String,
    /// Turn-loop variant.
    pub backend: LoopBackend,
    /// Iteration cap per turn.
    pub max_iterations: usize,
}

impl ManagerConfig {
    /// Config with default backend and iteration cap.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            cwd: cwd.into(),
            mcp_url: String::new(),
            backend: LoopBackend::Native,
            max_iterations: 25,
        }
    }
}

/// Build the standard record pipeline over a store and a bus.
///
/// Persists the request as a message row (sequence assigned inside the
/// write transaction) and publishes the row on the bus under its sequence
/// ID before returning.
#[must_use]
pub fn standard_record_fn(
    store: Arc<Store>,
    bus: Arc<SubPub<StreamUpdate>>,
    conversation_id: String,
) -> RecordFn {
    Arc::new(move |req, agent_working| {
        let llm_data = req
            .llm_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let user_data = req.user_data.as_ref().map(serde_json::to_string).transpose()?;
        let usage_data = req.usage.as_ref().map(serde_json::to_string).transpose()?;
        let display_data = req
            .display_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = store.create_message(&CreateMessageParams {
            conversation_id: conversation_id.clone(),
            message_type: req.message_type,
            llm_data,
            user_data,
            usage_data,
            display_data,
        })?;

        bus.publish(
            row.sequence_id,
            StreamUpdate {
                sequence_id: row.sequence_id,
                messages: vec![row.clone()],
                agent_working,
            },
        );
        Ok(row)
    })
}

/// Per-conversation coordinator; see the module docs.
pub struct ConversationManager {
    conversation_id: String,
    mcp_url: String,
    backend: LoopBackend,
    max_iterations: usize,

    store: Arc<Store>,
    bus: Arc<SubPub<StreamUpdate>>,
    record: RecordFn,

    working: AtomicBool,
    last_sequence: AtomicI64,
    context_window: AtomicU64,
    context_tokens: AtomicU64,

    cwd: Mutex<PathBuf>,
    last_touched: Mutex<Instant>,
    cancel: CancellationToken,

    turn_loop: Mutex<Option<Arc<dyn TurnLoop>>>,
    bridge: Mutex<Option<SubagentBridge>>,
    tool_set: Mutex<Option<Arc<dyn ToolSet>>>,
    tool_set_factory: Mutex<Option<ToolSetFactory>>,
}

impl ConversationManager {
    /// Construct a manager. The last persisted sequence ID is loaded from
    /// the store so synthetic state frames publish at the right position.
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        store: Arc<Store>,
        bus: Arc<SubPub<StreamUpdate>>,
        record: RecordFn,
    ) -> Arc<Self> {
        let last_sequence = match store.latest_message(&config.conversation_id) {
            Ok(row) => row.map_or(0, |m| m.sequence_id),
            Err(e) => {
                warn!(
                    conversation_id = %config.conversation_id,
                    error = %e,
                    "failed to load latest sequence, starting at 0"
                );
                0
            }
        };

        Arc::new(Self {
            conversation_id: config.conversation_id,
            mcp_url: config.mcp_url,
            backend: config.backend,
            max_iterations: config.max_iterations,
            store,
            bus,
            record,
            working: AtomicBool::new(false),
            last_sequence: AtomicI64::new(last_sequence),
            context_window: AtomicU64::new(0),
            context_tokens: AtomicU64::new(0),
            cwd: Mutex::new(config.cwd),
            last_touched: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            turn_loop: Mutex::new(None),
            bridge: Mutex::new(None),
            tool_set: Mutex::new(None),
            tool_set_factory: Mutex::new(None),
        })
    }

    /// The conversation this manager owns.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// The MCP endpoint advertised to the external CLI.
    #[must_use]
    pub fn mcp_url(&self) -> &str {
        &self.mcp_url
    }

    /// Iteration cap per turn.
    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// Current working directory.
    #[must_use]
    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().clone()
    }

    /// Update the working directory reported to tools.
    pub fn set_cwd(&self, cwd: impl Into<PathBuf>) {
        *self.cwd.lock() = cwd.into();
    }

    /// Install the sub-agent bridge used by the external-CLI adapter.
    pub fn set_subagent_bridge(&self, bridge: SubagentBridge) {
        *self.bridge.lock() = Some(bridge);
    }

    pub(crate) fn subagent_bridge(&self) -> Option<SubagentBridge> {
        self.bridge.lock().clone()
    }

    /// Install the toolset factory for the native loop.
    pub fn set_tool_set_factory(&self, factory: ToolSetFactory) {
        *self.tool_set_factory.lock() = Some(factory);
    }

    /// The conversation's toolset, built lazily on first use.
    #[must_use]
    pub fn tool_set(&self) -> Option<Arc<dyn ToolSet>> {
        let mut slot = self.tool_set.lock();
        if slot.is_none() {
            let factory = self.tool_set_factory.lock().clone();
            if let Some(factory) = factory {
                *slot = Some(factory(&self.cwd()));
            }
        }
        slot.clone()
    }

    /// Refresh the idle timestamp.
    pub fn touch(&self) {
        *self.last_touched.lock() = Instant::now();
    }

    /// Time since the last touch.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_touched.lock().elapsed()
    }

    /// Whether a turn is in flight.
    #[must_use]
    pub fn is_agent_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Flip the working flag. A transition publishes a synthetic state
    /// frame at the last persisted sequence so lagging viewers reflect the
    /// change; caught-up viewers pick it up from the next heartbeat.
    pub fn set_agent_working(&self, working: bool) {
        let prev = self.working.swap(working, Ordering::SeqCst);
        if prev != working {
            let sequence_id = self.last_sequence.load(Ordering::SeqCst);
            self.bus.publish(
                sequence_id,
                StreamUpdate {
                    sequence_id,
                    messages: Vec::new(),
                    agent_working: working,
                },
            );
        }
    }

    /// The model's context window in tokens, 0 when unknown.
    #[must_use]
    pub fn context_window(&self) -> u64 {
        self.context_window.load(Ordering::SeqCst)
    }

    /// Tokens currently occupying the context, from the latest usage.
    #[must_use]
    pub fn context_tokens(&self) -> u64 {
        self.context_tokens.load(Ordering::SeqCst)
    }

    /// Subscribers currently attached to this conversation's bus.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Run a request through the record pipeline and update counters.
    ///
    /// This is the only path by which turn loops persist messages.
    pub fn record_message(&self, request: &RecordRequest) -> Result<MessageRow> {
        let row = (self.record)(request, self.is_agent_working())?;
        self.last_sequence.fetch_max(row.sequence_id, Ordering::SeqCst);
        if let Some(usage) = &request.usage {
            self.context_tokens
                .store(usage.context_tokens(), Ordering::SeqCst);
        }
        self.touch();
        Ok(row)
    }

    /// Accept a user message: persist it (sequence assigned and published),
    /// make sure the turn-loop driver is running, and enqueue the message
    /// to it. Returns once the message is durable; never blocks on the LLM
    /// (though a full driver queue applies backpressure to the caller).
    pub async fn accept_user_message(
        self: &Arc<Self>,
        service: Option<Arc<dyn LlmService>>,
        model_id: &str,
        message: LlmMessage,
    ) -> Result<MessageRow> {
        self.touch();
        if let Some(service) = &service {
            self.context_window
                .store(service.token_context_window(), Ordering::SeqCst);
        }

        let row = self.record_message(&RecordRequest {
            message_type: MessageType::User,
            llm_message: Some(message.clone()),
            ..Default::default()
        })?;

        let turn_loop = self.ensure_turn_loop(service, model_id)?;
        turn_loop.queue_user_message(message).await;
        Ok(row)
    }

    /// Subscribe to this conversation's stream.
    ///
    /// The subscriber is registered on the bus first, then missed messages
    /// (`sequence_id > last_seen`) are read from the store — so nothing
    /// published in the gap is lost. A message may appear both in the
    /// returned replay and on the live subscription; consumers drop live
    /// rows at or below the replay's highest sequence.
    pub fn subscribe(
        &self,
        last_seen: i64,
        cancel: CancellationToken,
    ) -> Result<(Vec<MessageRow>, Subscription<StreamUpdate>)> {
        self.touch();
        let subscription = self.bus.subscribe(last_seen, cancel);
        let replayed = self.store.list_messages_after(&self.conversation_id, last_seen)?;
        Ok((replayed, subscription))
    }

    /// The driver's message history, empty when no driver has started.
    #[must_use]
    pub fn history(&self) -> Vec<LlmMessage> {
        self.turn_loop
            .lock()
            .as_ref()
            .map_or_else(Vec::new, |l| l.history())
    }

    /// Cancel the turn loop, close every subscriber buffer, and release
    /// the toolset. Called by the registry on eviction.
    pub fn shutdown(&self) {
        debug!(conversation_id = %self.conversation_id, "shutting down conversation manager");
        self.cancel.cancel();
        self.bus.close();
        if let Some(tool_set) = self.tool_set.lock().take() {
            tool_set.release();
        }
        self.working.store(false, Ordering::SeqCst);
    }

    fn ensure_turn_loop(
        self: &Arc<Self>,
        service: Option<Arc<dyn LlmService>>,
        model_id: &str,
    ) -> Result<Arc<dyn TurnLoop>> {
        let mut slot = self.turn_loop.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        let turn_loop: Arc<dyn TurnLoop> = match self.backend {
            LoopBackend::Native => {
                let service = service.ok_or_else(|| {
                    RuntimeError::Internal("native turn loop requires an LLM service".into())
                })?;
                NativeTurnLoop::new(self.clone(), service, model_id.to_owned())
            }
            LoopBackend::ExternalCli => ExternalCliLoop::new(self.clone()),
        };

        let driver = turn_loop.clone();
        let cancel = self.cancel.child_token();
        let conversation_id = self.conversation_id.clone();
        tokio::spawn(async move {
            debug!(conversation_id = %conversation_id, "turn loop started");
            driver.go(cancel).await;
            debug!(conversation_id = %conversation_id, "turn loop stopped");
        });

        *slot = Some(turn_loop.clone());
        Ok(turn_loop)
    }
}

impl Drop for ConversationManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
