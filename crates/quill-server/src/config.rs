//! Server configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which driver backs new conversations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentBackend {
    /// The in-process LLM turn loop.
    Native,
    /// The external `claude` CLI.
    Claude,
}

/// Configuration for the Quill server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Backend for new conversations.
    pub backend: AgentBackend,
    /// Model used when a request names none.
    pub default_model: String,
    /// Seconds a manager may sit idle before the sweeper evicts it.
    pub idle_timeout_secs: u64,
    /// Seconds between sweeper passes.
    pub sweep_interval_secs: u64,
    /// Seconds between stream heartbeat frames.
    pub heartbeat_interval_secs: u64,
    /// Max request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            db_path: PathBuf::from("quill.db"),
            backend: AgentBackend::Claude,
            default_model: "predictable".into(),
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
            heartbeat_interval_secs: 15,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// The MCP endpoint advertised to the external CLI for a conversation.
    #[must_use]
    pub fn mcp_url(&self, conversation_id: &str) -> String {
        format!(
            "http://localhost:{}/api/conversation/{conversation_id}/mcp",
            self.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.backend, AgentBackend::Claude);
        assert_eq!(cfg.idle_timeout_secs, 1800);
        assert_eq!(cfg.heartbeat_interval_secs, 15);
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig {
            port: 8000,
            backend: AgentBackend::Native,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, 8000);
        assert_eq!(back.backend, AgentBackend::Native);
    }

    #[test]
    fn backend_tags_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentBackend::Claude).unwrap(),
            "\"claude\""
        );
        assert_eq!(
            serde_json::to_string(&AgentBackend::Native).unwrap(),
            "\"native\""
        );
    }

    #[test]
    fn mcp_url_shape() {
        let cfg = ServerConfig {
            port: 8000,
            ..Default::default()
        };
        assert_eq!(
            cfg.mcp_url("cabc123"),
            "http://localhost:8000/api/conversation/cabc123/mcp"
        );
    }
}
