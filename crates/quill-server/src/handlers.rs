//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use quill_core::{LlmMessage, LlmService, ServiceError};
use quill_runtime::RuntimeError;
use quill_store::StoreError;

use crate::api::ApiConversation;
use crate::config::AgentBackend;
use crate::server::AppState;

/// Error type mapped onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound(_) | StoreError::MessageNotFound(_) => {
                Self::not_found(e.to_string())
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Store(store) => store.into(),
            RuntimeError::Service(ServiceError::UnknownModel(model)) => {
                Self::new(StatusCode::BAD_REQUEST, format!("unknown model: {model}"))
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        RuntimeError::Service(e).into()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bodies
// ─────────────────────────────────────────────────────────────────────────────

/// `POST /api/conversations/new`.
#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    /// First user message.
    pub message: String,
    /// Model ID; the configured default when absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Working directory for tools.
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Response to conversation creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateConversationResponse {
    /// The new conversation's ID.
    pub conversation_id: String,
}

/// `POST /api/conversation/{id}/message`.
#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    /// The user message.
    pub message: String,
    /// Model ID; the configured default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

/// `GET /api/conversations` query.
#[derive(Debug, Default, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    archived: Option<bool>,
}

/// Settings body/response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SettingValue {
    /// The setting's value.
    pub value: String,
}

/// `GET /health` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while serving.
    pub status: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Managers currently resident.
    pub active_conversations: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

fn resolve_service(
    state: &AppState,
    model: Option<&str>,
) -> Result<(Option<Arc<dyn LlmService>>, String), ApiError> {
    let model_id = model
        .filter(|m| !m.is_empty())
        .unwrap_or(&state.config.default_model)
        .to_owned();
    match state.config.backend {
        AgentBackend::Native => Ok((Some(state.provider.service(&model_id)?), model_id)),
        AgentBackend::Claude => Ok((None, model_id)),
    }
}

/// `POST /api/conversations/new` — create a conversation and accept its
/// first message.
pub async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .store
        .create_conversation(None, true, body.cwd.as_deref())?;
    let manager = state.registry.get_or_create(&conversation.conversation_id)?;
    let (service, model_id) = resolve_service(&state, body.model.as_deref())?;
    let _ = manager
        .accept_user_message(service, &model_id, LlmMessage::user_text(&body.message))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse {
            conversation_id: conversation.conversation_id,
        }),
    ))
}

/// `POST /api/conversation/{id}/message` — accept a message into an
/// existing conversation.
pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<StatusCode, ApiError> {
    let manager = state.registry.get_or_create(&conversation_id)?;
    let (service, model_id) = resolve_service(&state, body.model.as_deref())?;
    let _ = manager
        .accept_user_message(service, &model_id, LlmMessage::user_text(&body.message))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

/// `GET /api/conversation/{id}`.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ApiConversation>, ApiError> {
    let row = state.store.get_conversation(&conversation_id)?;
    Ok(Json(ApiConversation::from(&row)))
}

/// `GET /api/conversations` — list or search, active or archived.
pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ApiConversation>>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    let offset = query.offset.unwrap_or(0);
    let archived = query.archived.unwrap_or(false);
    let rows = match (&query.search, archived) {
        (Some(q), false) => state.store.search_conversations(q, limit, offset)?,
        (Some(q), true) => state.store.search_archived_conversations(q, limit, offset)?,
        (None, false) => state.store.list_conversations(limit, offset)?,
        (None, true) => state.store.list_archived_conversations(limit, offset)?,
    };
    Ok(Json(rows.iter().map(ApiConversation::from).collect()))
}

/// `DELETE /api/conversation/{id}` — evict the manager and delete the
/// conversation with its messages.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // 404 before deleting so the response is truthful.
    let _ = state.store.get_conversation(&conversation_id)?;
    state.registry.evict(&conversation_id);
    state.store.delete_conversation(&conversation_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/conversation/{id}/archive`.
pub async fn archive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ApiConversation>, ApiError> {
    let row = state.store.archive_conversation(&conversation_id)?;
    Ok(Json(ApiConversation::from(&row)))
}

/// `POST /api/conversation/{id}/unarchive`.
pub async fn unarchive_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ApiConversation>, ApiError> {
    let row = state.store.unarchive_conversation(&conversation_id)?;
    Ok(Json(ApiConversation::from(&row)))
}

/// `GET /api/conversation/{id}/subagents`.
pub async fn list_subagents(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<ApiConversation>>, ApiError> {
    let rows = state.store.list_subagents(&conversation_id)?;
    Ok(Json(rows.iter().map(ApiConversation::from).collect()))
}

/// `GET /api/settings/{key}`.
pub async fn get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<SettingValue>, ApiError> {
    match state.store.get_setting(&key)? {
        Some(value) => Ok(Json(SettingValue { value })),
        None => Err(ApiError::not_found(format!("setting not found: {key}"))),
    }
}

/// `PUT /api/settings/{key}`.
pub async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> Result<StatusCode, ApiError> {
    state.store.set_setting(&key, &body.value)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_conversations: state.registry.active_count(),
    })
}
