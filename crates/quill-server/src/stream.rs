//! The SSE conversation stream.
//!
//! `GET /api/conversation/{id}/stream?last_sequence_id=N` serves
//! `text/event-stream` frames. The subscriber is registered on the bus
//! before stored messages are read, so nothing published in the gap is
//! lost; live frames whose messages were already replayed are dropped by
//! sequence, keeping delivery exactly-once and ordered across the
//! replay/live seam.
//!
//! First-frame semantics: a fresh subscription gets the full snapshot
//! (with `context_window_size` when known); a resume gets only messages
//! past `last_sequence_id`, or a `heartbeat: true` frame when there are
//! none. Heartbeat frames carrying the live working state follow on an
//! interval.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_runtime::StreamUpdate;
use quill_subpub::Subscription;

use crate::api::{
    agent_working, to_api_messages, ApiConversation, ConversationState, StreamFrame,
};
use crate::handlers::ApiError;
use crate::server::AppState;

/// Stream query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Resume point: only messages with a greater sequence are sent.
    #[serde(default)]
    pub last_sequence_id: Option<i64>,
}

struct StreamDriver {
    subscription: Subscription<StreamUpdate>,
    heartbeat: tokio::time::Interval,
    /// Highest sequence already delivered via replay; live rows at or
    /// below it are dropped.
    floor: i64,
    conversation: ApiConversation,
    pending: Option<StreamFrame>,
}

impl StreamDriver {
    async fn next_frame(&mut self) -> Option<StreamFrame> {
        if let Some(first) = self.pending.take() {
            return Some(first);
        }
        loop {
            tokio::select! {
                update = self.subscription.next() => {
                    let update = update?;
                    let fresh: Vec<_> = update
                        .messages
                        .iter()
                        .filter(|m| m.sequence_id > self.floor)
                        .cloned()
                        .collect();
                    // A frame that only repeats replayed rows carries no news.
                    if fresh.is_empty() && !update.messages.is_empty() {
                        continue;
                    }
                    if let Some(last) = fresh.last() {
                        self.floor = last.sequence_id;
                    }
                    return Some(StreamFrame {
                        messages: to_api_messages(&fresh),
                        conversation_state: Some(ConversationState {
                            agent_working: update.agent_working,
                        }),
                        conversation: Some(self.conversation.clone()),
                        ..Default::default()
                    });
                }
                _ = self.heartbeat.tick() => {
                    return Some(StreamFrame {
                        heartbeat: true,
                        conversation_state: Some(ConversationState {
                            // The flag is folded in by the caller; the
                            // heartbeat closure re-reads it below.
                            agent_working: false,
                        }),
                        conversation: Some(self.conversation.clone()),
                        ..Default::default()
                    });
                }
            }
        }
    }
}

/// `GET /api/conversation/{id}/stream`.
pub async fn stream_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let conversation_row = state.store.get_conversation(&conversation_id)?;
    let conversation = ApiConversation::from(&conversation_row);
    let manager = state.registry.get_or_create(&conversation_id)?;

    let viewer_cancel: CancellationToken = state.shutdown.token().child_token();
    let last_seen = query.last_sequence_id.unwrap_or(0);
    let (replayed, subscription) = manager.subscribe(last_seen, viewer_cancel)?;

    let floor = replayed.last().map_or(last_seen, |m| m.sequence_id);
    let api_messages = to_api_messages(&replayed);

    let first = if query.last_sequence_id.is_some() {
        if api_messages.is_empty() {
            // Nothing missed: confirm liveness only.
            StreamFrame {
                heartbeat: true,
                conversation_state: Some(ConversationState {
                    agent_working: manager.is_agent_working(),
                }),
                conversation: Some(conversation.clone()),
                ..Default::default()
            }
        } else {
            StreamFrame {
                messages: api_messages,
                conversation_state: Some(ConversationState {
                    agent_working: manager.is_agent_working(),
                }),
                conversation: Some(conversation.clone()),
                ..Default::default()
            }
        }
    } else {
        // Fresh subscription: the full state snapshot, once.
        let working = manager.is_agent_working() || agent_working(&api_messages);
        let context_window = manager.context_window();
        StreamFrame {
            messages: api_messages,
            conversation_state: Some(ConversationState {
                agent_working: working,
            }),
            context_window_size: (context_window > 0).then_some(context_window),
            conversation: Some(conversation.clone()),
            ..Default::default()
        }
    };

    debug!(
        conversation_id = %conversation_id,
        resume = query.last_sequence_id.is_some(),
        replayed = first.messages.len(),
        "stream opened"
    );

    let period = Duration::from_secs(state.config.heartbeat_interval_secs.max(1));
    let heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let driver = StreamDriver {
        subscription,
        heartbeat,
        floor,
        conversation,
        pending: Some(first),
    };

    let stream = futures::stream::unfold(
        (driver, manager),
        |(mut driver, manager)| async move {
            let mut frame = driver.next_frame().await?;
            // Heartbeats report the live working flag at send time.
            if frame.heartbeat {
                frame.conversation_state = Some(ConversationState {
                    agent_working: manager.is_agent_working(),
                });
            }
            let event = match serde_json::to_string(&frame) {
                Ok(json) => Event::default().data(json),
                Err(e) => {
                    debug!(error = %e, "failed to serialize stream frame");
                    return None;
                }
            };
            Some((Ok::<_, Infallible>(event), (driver, manager)))
        },
    );

    Ok(Sse::new(stream))
}
