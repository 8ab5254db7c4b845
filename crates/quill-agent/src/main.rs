//! # quill-agent
//!
//! The Quill server binary: opens the database, runs migrations, wires
//! the registry and HTTP server, and serves until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use quill_server::{
    AgentBackend, PredictableService, QuillServer, ServerConfig, StaticProvider,
};
use quill_store::{PoolConfig, Store};

/// Quill agent server.
#[derive(Parser, Debug)]
#[command(name = "quill-agent", about = "Quill AI coding-agent server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Path to the SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Backend for new conversations: `claude` (external CLI) or `native`.
    #[arg(long, value_enum, default_value = "claude")]
    backend: BackendArg,

    /// Model used when a request names none (native backend).
    #[arg(long, default_value = "predictable")]
    default_model: String,

    /// Minutes a conversation may sit idle before eviction.
    #[arg(long, default_value = "30")]
    idle_timeout_mins: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Claude,
    Native,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        quill_core::paths::quill_config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("quill.db")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    quill_core::logging::init("info");

    let cli = Cli::parse();
    let db_path = cli.db_path.clone().unwrap_or_else(Cli::default_db_path);

    let store = Arc::new(
        Store::open(&PoolConfig::new(&db_path))
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    let applied = store.migrate().context("failed to run migrations")?;
    info!(db_path = %db_path.display(), applied, "database ready");

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        db_path,
        backend: match cli.backend {
            BackendArg::Claude => AgentBackend::Claude,
            BackendArg::Native => AgentBackend::Native,
        },
        default_model: cli.default_model,
        idle_timeout_secs: cli.idle_timeout_mins * 60,
        ..Default::default()
    };

    let provider = Arc::new(
        StaticProvider::new().with_service("predictable", Arc::new(PredictableService)),
    );

    let server = QuillServer::new(config, store, provider);
    let (addr, handle) = server
        .listen()
        .await
        .context("failed to bind the HTTP listener")?;
    info!(addr = %addr, "quill-agent serving");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");

    server
        .shutdown()
        .graceful_shutdown(Some(Duration::from_secs(10)))
        .await;
    let _ = handle.await;
    Ok(())
}
