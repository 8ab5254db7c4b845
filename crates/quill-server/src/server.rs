//! `QuillServer` — axum HTTP/SSE server wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, instrument};

use quill_core::LlmProvider;
use quill_runtime::{
    standard_record_fn, ConversationManager, ConversationRegistry, LoopBackend, ManagerConfig,
    ManagerFactory, RuntimeError,
};
use quill_store::Store;
use quill_subpub::SubPub;

use crate::config::{AgentBackend, ServerConfig};
use crate::handlers;
use crate::shutdown::ShutdownCoordinator;
use crate::stream;

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// The message store.
    pub store: Arc<Store>,
    /// Active conversation managers.
    pub registry: Arc<ConversationRegistry>,
    /// Model-ID resolution.
    pub provider: Arc<dyn LlmProvider>,
    /// Server configuration.
    pub config: ServerConfig,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
}

/// Build the standard manager factory for a server: record pipeline over
/// a per-conversation bus, backend per config, and a sub-agent bridge
/// that materializes child conversations through the registry.
#[must_use]
pub fn manager_factory(store: Arc<Store>, config: ServerConfig) -> ManagerFactory {
    Arc::new(move |row, registry_weak| {
        let bus = Arc::new(SubPub::new());
        let record = standard_record_fn(store.clone(), bus.clone(), row.conversation_id.clone());

        let mut manager_config = ManagerConfig::new(
            &row.conversation_id,
            row.cwd.clone().unwrap_or_else(|| ".".into()),
        );
        manager_config.mcp_url = config.mcp_url(&row.conversation_id);
        manager_config.backend = match config.backend {
            AgentBackend::Claude => LoopBackend::ExternalCli,
            AgentBackend::Native => LoopBackend::Native,
        };

        let manager = ConversationManager::new(manager_config, store.clone(), bus, record);

        let bridge_store = store.clone();
        manager.set_subagent_bridge(Arc::new(move |slug, parent_id, cwd| {
            let registry = registry_weak
                .upgrade()
                .ok_or_else(|| RuntimeError::Bridge("registry no longer running".into()))?;
            let (conversation, _slug) = bridge_store.get_or_create_subagent_conversation(
                slug,
                parent_id,
                Some(&cwd.to_string_lossy()),
            )?;
            registry.get_or_create(&conversation.conversation_id)
        }));

        Ok(manager)
    })
}

/// The Quill HTTP server.
pub struct QuillServer {
    config: ServerConfig,
    store: Arc<Store>,
    registry: Arc<ConversationRegistry>,
    provider: Arc<dyn LlmProvider>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
}

impl QuillServer {
    /// Wire a server over an opened (and migrated) store.
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<Store>, provider: Arc<dyn LlmProvider>) -> Self {
        let factory = manager_factory(store.clone(), config.clone());
        let registry = ConversationRegistry::new(
            store.clone(),
            factory,
            Duration::from_secs(config.idle_timeout_secs),
        );
        Self {
            config,
            store,
            registry,
            provider,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
        }
    }

    /// Build the router with all routes and middleware.
    #[must_use]
    pub fn router(&self) -> Router {
        let state = AppState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            provider: self.provider.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/health", get(handlers::health))
            .route("/api/conversations", get(handlers::list_conversations))
            .route(
                "/api/conversations/new",
                post(handlers::create_conversation),
            )
            .route(
                "/api/conversation/{id}",
                get(handlers::get_conversation).delete(handlers::delete_conversation),
            )
            .route(
                "/api/conversation/{id}/message",
                post(handlers::post_message),
            )
            .route(
                "/api/conversation/{id}/stream",
                get(stream::stream_conversation),
            )
            .route(
                "/api/conversation/{id}/archive",
                post(handlers::archive_conversation),
            )
            .route(
                "/api/conversation/{id}/unarchive",
                post(handlers::unarchive_conversation),
            )
            .route(
                "/api/conversation/{id}/subagents",
                get(handlers::list_subagents),
            )
            .route(
                "/api/settings/{key}",
                get(handlers::get_setting).put(handlers::put_setting),
            )
            .with_state(state)
            // Outermost layers run first on the way in.
            .layer(CatchPanicLayer::new())
            .layer(CompressionLayer::new())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_bytes))
    }

    /// Bind and serve. Returns the bound address and the server task;
    /// also starts the registry sweeper, registered for shutdown.
    #[instrument(skip_all, fields(host = %self.config.host, port = self.config.port))]
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, backend = ?self.config.backend, "server started");

        let sweeper = self.registry.spawn_sweeper(
            self.shutdown.token(),
            Duration::from_secs(self.config.sweep_interval_secs.max(1)),
        );
        self.shutdown.register_task(sweeper);

        let router = self.router();
        let shutdown_token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    info!("server shutdown initiated");
                })
                .await;
            info!("server shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    /// The conversation registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.registry
    }

    /// The message store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The shutdown coordinator.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
