//! # quill-server
//!
//! The HTTP/SSE surface of the Quill agent server: conversation CRUD, the
//! resumable event stream, settings, and health — wired over the store,
//! the conversation registry, and an LLM provider.

pub mod api;
pub mod config;
pub mod handlers;
pub mod provider;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use api::{agent_working, ApiConversation, ApiMessage, ConversationState, StreamFrame};
pub use config::{AgentBackend, ServerConfig};
pub use provider::{PredictableService, StaticProvider};
pub use server::{AppState, QuillServer};
pub use shutdown::ShutdownCoordinator;
