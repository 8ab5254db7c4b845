//! External-agent stream adapter.
//!
//! [`ExternalCliLoop`] drives a conversation through the external `claude`
//! CLI instead of the in-process LLM loop. The CLI emits line-delimited
//! JSON events; [`ExternalCliLoop::process_stream`] reassembles them into
//! well-formed messages and records them through the conversation
//! manager's pipeline:
//!
//! - consecutive `assistant` events sharing a `message.id` merge into one
//!   assistant message;
//! - a `user` event (or an `assistant` event with a new ID) flushes the
//!   message being assembled;
//! - events carrying a `parent_tool_use_id` belong to a Task sub-agent and
//!   are routed to a child conversation created on first encounter via the
//!   manager's bridge — they never appear in the parent's stream;
//! - a top-level `tool_result` with a `tool_use_result` marker completes
//!   the sub-agent session.
//!
//! Unparseable lines are skipped; parsing continues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use async_trait::async_trait;
use quill_core::{ContentBlock, LlmMessage, Role};
use quill_store::MessageType;

use crate::errors::{Result, RuntimeError};
use crate::manager::{ConversationManager, RecordRequest};
use crate::turn_loop::{TurnLoop, USER_MESSAGE_QUEUE};

/// Longest slug derived from a Task description.
const SLUG_MAX_LEN: usize = 40;

/// Slug length when falling back to the tool-use ID.
const SLUG_FALLBACK_LEN: usize = 12;

/// Derive a sub-agent slug from a Task tool description: lowercase, keep
/// `[a-z0-9-]`, map spaces and underscores to `-`, collapse runs, trim,
/// cap at 40 characters.
#[must_use]
pub fn description_to_slug(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());
    for c in description.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' | '-' => slug.push(c),
            ' ' | '_' => slug.push('-'),
            _ => {}
        }
    }
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let mut slug = slug.trim_matches('-').to_owned();
    if slug.len() > SLUG_MAX_LEN {
        slug.truncate(SLUG_MAX_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    slug
}

/// The CLI's stable session identifier for a conversation: the first 16
/// bytes of SHA-256(conversation ID), formatted as a canonical UUID.
#[must_use]
pub fn conversation_session_uuid(conversation_id: &str) -> String {
    let digest = Sha256::digest(conversation_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    message: EventMessage,
    #[serde(default)]
    parent_tool_use_id: String,
    #[serde(default)]
    tool_use_result: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct EventMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content: Vec<EventContent>,
}

#[derive(Debug, Default, Deserialize)]
struct EventContent {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

/// The Task tool input fields needed for bridging.
#[derive(Clone, Debug, Default, Deserialize)]
struct TaskInput {
    #[serde(default)]
    description: String,
}

/// Convert a `tool_result` content payload into content blocks. Tries a
/// bare string, then a list of typed blocks (text/image), then falls back
/// to the raw JSON as opaque text.
fn parse_tool_result_content(raw: Option<&Value>) -> Vec<ContentBlock> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    if let Value::String(text) = raw {
        return vec![ContentBlock::text(text.clone())];
    }

    #[derive(Deserialize)]
    struct ResultBlock {
        #[serde(rename = "type", default)]
        block_type: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        source: Option<ResultSource>,
    }
    #[derive(Deserialize)]
    struct ResultSource {
        #[serde(rename = "type", default)]
        source_type: String,
        #[serde(default)]
        media_type: String,
        #[serde(default)]
        data: String,
    }

    if let Ok(blocks) = serde_json::from_value::<Vec<ResultBlock>>(raw.clone()) {
        let mut out = Vec::new();
        for block in blocks {
            match block.block_type.as_str() {
                "text" => out.push(ContentBlock::text(block.text)),
                "image" => {
                    if let Some(source) = block.source {
                        if source.source_type == "base64" {
                            out.push(ContentBlock::Image {
                                media_type: source.media_type,
                                data: source.data,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        return out;
    }

    vec![ContentBlock::text(raw.to_string())]
}

// ─────────────────────────────────────────────────────────────────────────────
// Reassembly state
// ─────────────────────────────────────────────────────────────────────────────

/// An in-flight Task sub-agent whose events are recorded into a child
/// conversation.
struct SubagentSession {
    manager: Arc<ConversationManager>,
    last_msg_id: String,
    pending_assistant: Option<LlmMessage>,
    pending_user: Option<LlmMessage>,
}

fn flush_subagent_assistant(session: &mut SubagentSession) {
    if let Some(mut message) = session.pending_assistant.take() {
        message.end_of_turn = !message.has_tool_use();
        if let Err(e) = session.manager.record_message(&RecordRequest {
            message_type: MessageType::Agent,
            llm_message: Some(message),
            ..Default::default()
        }) {
            error!(
                conversation_id = %session.manager.conversation_id(),
                error = %e,
                "failed to record subagent assistant message"
            );
        }
    }
}

fn flush_subagent_user(session: &mut SubagentSession) {
    if let Some(message) = session.pending_user.take() {
        if let Err(e) = session.manager.record_message(&RecordRequest {
            message_type: MessageType::User,
            llm_message: Some(message),
            ..Default::default()
        }) {
            error!(
                conversation_id = %session.manager.conversation_id(),
                error = %e,
                "failed to record subagent user message"
            );
        }
    }
}

#[derive(Default)]
struct StreamState {
    current_assistant: Option<LlmMessage>,
    current_user: Option<LlmMessage>,
    current_msg_id: String,
    /// Task invocations by `tool_use_id`, so the slug is known when the
    /// first sub-agent event arrives.
    task_inputs: HashMap<String, TaskInput>,
    /// In-flight sub-agent sessions by `parent_tool_use_id`.
    subagents: HashMap<String, SubagentSession>,
}

// ─────────────────────────────────────────────────────────────────────────────
// The loop
// ─────────────────────────────────────────────────────────────────────────────

/// Turn-loop driver backed by the external `claude` CLI.
pub struct ExternalCliLoop {
    manager: Arc<ConversationManager>,
    inbox_tx: mpsc::Sender<LlmMessage>,
    inbox_rx: tokio::sync::Mutex<Option<mpsc::Receiver<LlmMessage>>>,
    history: Mutex<Vec<LlmMessage>>,
}

impl ExternalCliLoop {
    /// Build a driver bound to `manager`.
    #[must_use]
    pub fn new(manager: Arc<ConversationManager>) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(USER_MESSAGE_QUEUE);
        Arc::new(Self {
            manager,
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(Some(inbox_rx)),
            history: Mutex::new(Vec::new()),
        })
    }

    async fn process_message(&self, cancel: &CancellationToken, message: LlmMessage) {
        self.manager.set_agent_working(true);
        let outcome = self.run_cli_turn(cancel, &message).await;
        self.manager.set_agent_working(false);

        match outcome {
            Ok(()) => {}
            Err(RuntimeError::Cancelled) => {
                debug!(
                    conversation_id = %self.manager.conversation_id(),
                    "external CLI turn cancelled"
                );
            }
            Err(e) => {
                error!(
                    conversation_id = %self.manager.conversation_id(),
                    error = %e,
                    "external CLI turn failed"
                );
            }
        }
    }

    async fn run_cli_turn(&self, cancel: &CancellationToken, message: &LlmMessage) -> Result<()> {
        let prompt = message.text();
        let conversation_id = self.manager.conversation_id().to_owned();

        let mcp_file = write_mcp_config(&conversation_id, self.manager.mcp_url())?;
        let session_id = conversation_session_uuid(&conversation_id);
        let is_first_turn = self.history.lock().is_empty();
        let max_turns = self.manager.max_iterations().to_string();

        let mut args: Vec<String> = vec![
            "-p".into(),
            prompt,
            "--verbose".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--max-turns".into(),
            max_turns,
            "--permission-mode".into(),
            "bypassPermissions".into(),
            "--mcp-config".into(),
            mcp_file.path.to_string_lossy().into_owned(),
            "--include-partial-messages".into(),
        ];
        if is_first_turn {
            args.push("--session-id".into());
        } else {
            args.push("--resume".into());
        }
        args.push(session_id);

        let mut child = Command::new("claude")
            .args(&args)
            .current_dir(self.manager.cwd())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Internal("claude stdout not captured".into()))?;

        let stream_result = self.process_stream(cancel, BufReader::new(stdout)).await;
        if cancel.is_cancelled() {
            let _ = child.kill().await;
            return Err(RuntimeError::Cancelled);
        }
        stream_result?;

        let status = child.wait().await?;
        if !status.success() {
            warn!(
                conversation_id = %conversation_id,
                status = %status,
                "claude exited with non-zero status"
            );
        }
        Ok(())
    }

    /// Reassemble a stream-json event stream and record the resulting
    /// messages. Separated from process management so it can be driven
    /// from captured streams in tests.
    pub async fn process_stream<R>(&self, cancel: &CancellationToken, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut state = StreamState::default();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&mut state, &line),
                    Ok(None) => break,
                    Err(e) => {
                        self.finish(&mut state);
                        return Err(e.into());
                    }
                },
            }
        }

        self.finish(&mut state);
        Ok(())
    }

    fn handle_line(&self, state: &mut StreamState, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        // Malformed lines are skipped; parsing continues.
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            debug!("skipping unparseable stream line");
            return;
        };
        match event.event_type.as_str() {
            "assistant" | "user" => self.handle_message_event(state, event),
            _ => {}
        }
    }

    fn handle_message_event(&self, state: &mut StreamState, event: StreamEvent) {
        let is_assistant = event.event_type == "assistant";
        let top_level = event.parent_tool_use_id.is_empty();

        // Track Task invocations so the slug is known when the sub-agent's
        // first event arrives.
        if is_assistant && top_level {
            for block in &event.message.content {
                if block.block_type == "tool_use" && block.name == "Task" {
                    let input: TaskInput = block
                        .input
                        .clone()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    state.task_inputs.insert(block.id.clone(), input);
                }
            }
        }

        // A top-level Task tool_result with a completion marker means the
        // sub-agent is done: flush its session and clear its flag.
        if !is_assistant && top_level && event.tool_use_result.is_some() {
            for block in &event.message.content {
                if block.block_type == "tool_result" {
                    if let Some(session) = state.subagents.get_mut(&block.tool_use_id) {
                        flush_subagent_assistant(session);
                        flush_subagent_user(session);
                        session.manager.set_agent_working(false);
                    }
                }
            }
        }

        // Sub-agent events route to the child conversation and never
        // appear in the parent's stream.
        if !top_level {
            self.route_subagent_event(state, is_assistant, &event);
            return;
        }

        if is_assistant {
            if event.message.id != state.current_msg_id || state.current_assistant.is_none() {
                self.flush_assistant(state);
                // A new assistant message means the prior user message is
                // fully assembled too.
                self.flush_user(state);
                state.current_msg_id = event.message.id.clone();
            }
            let assistant = state
                .current_assistant
                .get_or_insert_with(|| LlmMessage::empty(Role::Assistant));
            append_assistant_blocks(assistant, &event.message.content);
        } else {
            self.flush_assistant(state);
            let user = state
                .current_user
                .get_or_insert_with(|| LlmMessage::empty(Role::User));
            for block in &event.message.content {
                if block.block_type == "tool_result" {
                    user.content.push(ContentBlock::ToolResult {
                        tool_use_id: block.tool_use_id.clone(),
                        content: parse_tool_result_content(block.content.as_ref()),
                        is_error: block.is_error,
                    });
                }
            }
        }
    }

    fn route_subagent_event(
        &self,
        state: &mut StreamState,
        is_assistant: bool,
        event: &StreamEvent,
    ) {
        let parent_tool_use_id = &event.parent_tool_use_id;
        if !state.subagents.contains_key(parent_tool_use_id) {
            let Some(session) = self.create_subagent_session(state, parent_tool_use_id) else {
                return;
            };
            state
                .subagents
                .insert(parent_tool_use_id.clone(), session);
        }
        let Some(session) = state.subagents.get_mut(parent_tool_use_id) else {
            return;
        };

        if is_assistant {
            if event.message.id != session.last_msg_id || session.pending_assistant.is_none() {
                flush_subagent_assistant(session);
                flush_subagent_user(session);
                session.last_msg_id = event.message.id.clone();
            }
            let assistant = session
                .pending_assistant
                .get_or_insert_with(|| LlmMessage::empty(Role::Assistant));
            append_assistant_blocks(assistant, &event.message.content);
        } else {
            flush_subagent_assistant(session);
            let user = session
                .pending_user
                .get_or_insert_with(|| LlmMessage::empty(Role::User));
            for block in &event.message.content {
                match block.block_type.as_str() {
                    // The initial prompt forwarded to the sub-agent.
                    "text" => user.content.push(ContentBlock::text(block.text.clone())),
                    "tool_result" => user.content.push(ContentBlock::ToolResult {
                        tool_use_id: block.tool_use_id.clone(),
                        content: parse_tool_result_content(block.content.as_ref()),
                        is_error: block.is_error,
                    }),
                    _ => {}
                }
            }
        }
    }

    fn create_subagent_session(
        &self,
        state: &StreamState,
        parent_tool_use_id: &str,
    ) -> Option<SubagentSession> {
        let bridge = self.manager.subagent_bridge()?;
        // The Task tool_use has to arrive before its sub-agent events; if
        // it hasn't, skip until it does.
        let input = state.task_inputs.get(parent_tool_use_id)?;

        let mut slug = description_to_slug(&input.description);
        if slug.is_empty() {
            slug = parent_tool_use_id
                .chars()
                .take(SLUG_FALLBACK_LEN)
                .collect();
        }

        let cwd = self.manager.cwd();
        match bridge(&slug, self.manager.conversation_id(), &cwd) {
            Ok(manager) => {
                manager.set_agent_working(true);
                Some(SubagentSession {
                    manager,
                    last_msg_id: String::new(),
                    pending_assistant: None,
                    pending_user: None,
                })
            }
            Err(e) => {
                warn!(slug = %slug, error = %e, "failed to create subagent conversation");
                None
            }
        }
    }

    fn flush_assistant(&self, state: &mut StreamState) {
        if let Some(mut message) = state.current_assistant.take() {
            message.end_of_turn = !message.has_tool_use();
            if let Err(e) = self.manager.record_message(&RecordRequest {
                message_type: MessageType::Agent,
                llm_message: Some(message.clone()),
                ..Default::default()
            }) {
                error!(
                    conversation_id = %self.manager.conversation_id(),
                    error = %e,
                    "failed to record assistant message"
                );
            }
            self.history.lock().push(message);
        }
    }

    fn flush_user(&self, state: &mut StreamState) {
        if let Some(message) = state.current_user.take() {
            if let Err(e) = self.manager.record_message(&RecordRequest {
                message_type: MessageType::User,
                llm_message: Some(message.clone()),
                ..Default::default()
            }) {
                error!(
                    conversation_id = %self.manager.conversation_id(),
                    error = %e,
                    "failed to record user message"
                );
            }
            self.history.lock().push(message);
        }
    }

    fn finish(&self, state: &mut StreamState) {
        self.flush_assistant(state);
        self.flush_user(state);
        for session in state.subagents.values_mut() {
            flush_subagent_assistant(session);
            flush_subagent_user(session);
            session.manager.set_agent_working(false);
        }
    }
}

fn append_assistant_blocks(message: &mut LlmMessage, blocks: &[EventContent]) {
    for block in blocks {
        match block.block_type.as_str() {
            "text" => message.content.push(ContentBlock::text(block.text.clone())),
            "thinking" => message.content.push(ContentBlock::Thinking {
                thinking: block.thinking.clone(),
            }),
            "tool_use" => message.content.push(ContentBlock::ToolUse {
                id: block.id.clone(),
                name: block.name.clone(),
                input: block.input.clone().unwrap_or(Value::Null),
            }),
            _ => {}
        }
    }
}

#[async_trait]
impl TurnLoop for ExternalCliLoop {
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

/// MCP config file handed to the CLI; removed on drop.
struct McpConfigFile {
    path: PathBuf,
}

impl Drop for McpConfigFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_mcp_config(conversation_id: &str, mcp_url: &str) -> Result<McpConfigFile> {
    let config = json!({
        "mcpServers": {
            "quill": {
                "type": "http",
                "url": mcp_url,
            }
        }
    });
    let path = std::env::temp_dir().join(format!("mcp_{conversation_id}.json"));
    std::fs::write(&path, serde_json::to_vec(&config)?)?;
    Ok(McpConfigFile { path })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
