//! # sluiced
//!
//! Sluice replication server binary: opens the event store and serves the
//! WebSocket replication protocol until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sluice_server::{ReplicationConfig, ReplicationServer};
use sluice_store::{EventStore, MemoryEventStore, SqliteEventStore};
use tracing_subscriber::EnvFilter;

/// Sluice replication server.
#[derive(Parser, Debug)]
#[command(name = "sluiced", about = "Durable event stream replication over WebSocket")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value = "4690")]
    port: u16,

    /// Path to the `SQLite` event database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Keep events in memory instead of `SQLite` (lost on exit).
    #[arg(long)]
    ephemeral: bool,

    /// Milliseconds between server pings.
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Milliseconds to wait for a pong before closing a connection.
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Events buffered per subscription while its replay runs.
    #[arg(long)]
    max_buffer_size: Option<usize>,
}

impl Cli {
    fn default_db_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".sluice").join("events.db")
    }

    fn config(&self) -> ReplicationConfig {
        let base = ReplicationConfig::default();
        ReplicationConfig {
            host: self.host.clone(),
            port: self.port,
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(base.heartbeat_interval_ms),
            heartbeat_timeout_ms: self.heartbeat_timeout_ms.unwrap_or(base.heartbeat_timeout_ms),
            max_buffer_size: self.max_buffer_size.unwrap_or(base.max_buffer_size),
            ..base
        }
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let metrics = sluice_server::metrics::install_recorder();
    let config = args.config();

    let store: Arc<dyn EventStore> = if args.ephemeral {
        tracing::info!("Ephemeral store selected; events will not be persisted");
        Arc::new(MemoryEventStore::new())
    } else {
        let db_path = args.db_path.unwrap_or_else(Cli::default_db_path);
        ensure_parent_dir(&db_path)?;
        let store = SqliteEventStore::open(&db_path)
            .with_context(|| format!("Failed to open event database: {}", db_path.display()))?;
        tracing::info!(path = %db_path.display(), "Event database opened");
        Arc::new(store)
    };

    let server = ReplicationServer::new(config, store, metrics);
    let handle = server.start().await.context("Failed to bind server")?;

    tracing::info!(
        "sluiced listening on ws://{}/ws (health at http://{}/health)",
        handle.addr,
        handle.addr
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.stop(handle, Some(Duration::from_secs(10))).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
