//! End-to-end test of the external-CLI stream adapter: a captured
//! stream-json session containing a Task sub-agent is reassembled into the
//! main conversation and a bridged child conversation.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use quill_core::{ContentBlock, LlmMessage, Role};
use quill_runtime::{
    ConversationManager, ExternalCliLoop, LoopBackend, ManagerConfig, RecordFn, RecordRequest,
};
use quill_store::{MessageRow, PoolConfig, Store};
use quill_subpub::SubPub;

/// A stream-json session: the agent thinks, delegates to a Task sub-agent
/// that runs one Bash command, then answers. Assistant events for
/// `msg_01` arrive split and must merge.
const SUBAGENT_STREAM: &str = r#"
{"type":"system","subtype":"init","session_id":"b9c3"}
{"type":"assistant","message":{"id":"msg_01","role":"assistant","content":[{"type":"thinking","thinking":"Delegating to a subagent."}]}}
{"type":"assistant","message":{"id":"msg_01","role":"assistant","content":[{"type":"tool_use","id":"toolu_task1","name":"Task","input":{"description":"Run echo command","prompt":"Run `echo hello` and report the output.","subagent_type":"general-purpose"}}]}}
{"type":"user","parent_tool_use_id":"toolu_task1","message":{"role":"user","content":[{"type":"text","text":"Run `echo hello` and report the output."}]}}
{"type":"assistant","parent_tool_use_id":"toolu_task1","message":{"id":"msg_sub1","role":"assistant","content":[{"type":"tool_use","id":"toolu_bash1","name":"Bash","input":{"command":"echo hello"}}]}}
{"type":"user","parent_tool_use_id":"toolu_task1","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_bash1","content":"hello\n"}]}}
not json at all, skipped
{"type":"user","tool_use_result":{"status":"completed"},"message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_task1","content":[{"type":"text","text":"The command printed: hello"}]}]}}
{"type":"assistant","message":{"id":"msg_02","role":"assistant","content":[{"type":"text","text":"The echo command printed \"hello\"."}]}}
{"type":"result","result":"The echo command printed \"hello\"."}
"#;

/// Record pipeline that captures messages instead of publishing; rows are
/// fabricated with incrementing sequence IDs.
fn capture_record(log: Arc<Mutex<Vec<(String, LlmMessage)>>>) -> RecordFn {
    let next = Arc::new(std::sync::atomic::AtomicI64::new(0));
    Arc::new(move |req: &RecordRequest, _working| {
        let sequence_id = next.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        let message = req
            .llm_message
            .clone()
            .expect("adapter messages always carry llm content");
        log.lock()
            .push((req.message_type.as_str().to_owned(), message));
        Ok(MessageRow {
            message_id: format!("m{sequence_id}"),
            conversation_id: "captured".into(),
            sequence_id,
            message_type: req.message_type.as_str().to_owned(),
            llm_data: None,
            user_data: None,
            usage_data: None,
            display_data: None,
            created_at: String::new(),
        })
    })
}

fn manager_with_capture(
    store: &Arc<Store>,
    conversation_id: &str,
    log: Arc<Mutex<Vec<(String, LlmMessage)>>>,
) -> Arc<ConversationManager> {
    let mut config = ManagerConfig::new(conversation_id, "/tmp");
    config.backend = LoopBackend::ExternalCli;
    ConversationManager::new(
        config,
        store.clone(),
        Arc::new(SubPub::new()),
        capture_record(log),
    )
}

#[tokio::test]
async fn subagent_bridge_splits_streams() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap());
    store.migrate().unwrap();

    let conv = store.create_conversation(None, true, None).unwrap();

    let main_log: Arc<Mutex<Vec<(String, LlmMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    let sub_log: Arc<Mutex<Vec<(String, LlmMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_slug: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let main_cm = manager_with_capture(&store, &conv.conversation_id, main_log.clone());

    let bridge_store = store.clone();
    let bridge_sub_log = sub_log.clone();
    let bridge_slug = captured_slug.clone();
    main_cm.set_subagent_bridge(Arc::new(move |slug, parent_id, cwd| {
        *bridge_slug.lock() = Some(slug.to_owned());
        let sub_conv = bridge_store.create_subagent_conversation(
            slug,
            parent_id,
            Some(&cwd.to_string_lossy()),
        )?;
        Ok(manager_with_capture(
            &bridge_store,
            &sub_conv.conversation_id,
            bridge_sub_log.clone(),
        ))
    }));

    let cli_loop = ExternalCliLoop::new(main_cm.clone());
    cli_loop
        .process_stream(&CancellationToken::new(), SUBAGENT_STREAM.trim().as_bytes())
        .await
        .unwrap();

    // The slug comes from the Task description.
    assert_eq!(captured_slug.lock().as_deref(), Some("run-echo-command"));

    // The bridged child exists in the store under the parent.
    let subagents = store.list_subagents(&conv.conversation_id).unwrap();
    assert_eq!(subagents.len(), 1);
    assert_eq!(subagents[0].slug.as_deref(), Some("run-echo-command"));

    // Main conversation: assistant (thinking + Task), user (Task result),
    // assistant (final text, end of turn).
    let main = main_log.lock();
    assert_eq!(main.len(), 3, "main messages: {main:#?}");

    let (kind, m0) = &main[0];
    assert_eq!(kind, "agent");
    assert_eq!(m0.role, Role::Assistant);
    assert_eq!(m0.content.len(), 2, "thinking + tool_use merged by id");
    assert!(m0
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::ToolUse { name, .. } if name == "Task")));
    assert!(!m0.end_of_turn);

    let (kind, m1) = &main[1];
    assert_eq!(kind, "user");
    assert_eq!(m1.role, Role::User);
    assert!(m1
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_task1")));

    let (kind, m2) = &main[2];
    assert_eq!(kind, "agent");
    assert!(m2.end_of_turn);
    assert!(m2
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::Text { text } if !text.is_empty())));

    // Child conversation: user prompt, assistant Bash tool_use (not end of
    // turn), user Bash tool_result.
    let sub = sub_log.lock();
    assert_eq!(sub.len(), 3, "subagent messages: {sub:#?}");

    let (kind, s0) = &sub[0];
    assert_eq!(kind, "user");
    assert!(s0
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::Text { text } if !text.is_empty())));

    let (kind, s1) = &sub[1];
    assert_eq!(kind, "agent");
    assert!(s1
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::ToolUse { name, .. } if name == "Bash")));
    assert!(!s1.end_of_turn);

    let (kind, s2) = &sub[2];
    assert_eq!(kind, "user");
    assert!(s2
        .content
        .iter()
        .any(|c| matches!(c, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "toolu_bash1")));

    // The bash result arrived as a bare string and parses to text.
    let ContentBlock::ToolResult { content, .. } = &s2.content[0] else {
        panic!("expected tool_result");
    };
    assert_eq!(content[0], ContentBlock::text("hello\n"));
}

#[tokio::test]
async fn stream_without_bridge_keeps_subagent_events_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap());
    store.migrate().unwrap();
    let conv = store.create_conversation(None, true, None).unwrap();

    let main_log: Arc<Mutex<Vec<(String, LlmMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    let main_cm = manager_with_capture(&store, &conv.conversation_id, main_log.clone());
    // No bridge installed: sub-agent events are dropped, top-level intact.

    let cli_loop = ExternalCliLoop::new(main_cm);
    cli_loop
        .process_stream(&CancellationToken::new(), SUBAGENT_STREAM.trim().as_bytes())
        .await
        .unwrap();

    let main = main_log.lock();
    assert_eq!(main.len(), 3);
    assert!(main.iter().all(|(_, m)| {
        !m.content
            .iter()
            .any(|c| matches!(c, ContentBlock::ToolUse { name, .. } if name == "Bash"))
    }));
}

#[tokio::test]
async fn cancellation_stops_stream_without_flushing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap());
    store.migrate().unwrap();
    let conv = store.create_conversation(None, true, None).unwrap();

    let main_log: Arc<Mutex<Vec<(String, LlmMessage)>>> = Arc::new(Mutex::new(Vec::new()));
    let main_cm = manager_with_capture(&store, &conv.conversation_id, main_log.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let cli_loop = ExternalCliLoop::new(main_cm);
    let err = cli_loop
        .process_stream(&cancel, SUBAGENT_STREAM.trim().as_bytes())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "operation cancelled");
    assert!(main_log.lock().is_empty(), "partial output must not be recorded");
}
