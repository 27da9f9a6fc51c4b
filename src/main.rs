//! ==============================================================================
//! main.rs - telemetry hub entry point
//! ==============================================================================
//!
//! purpose:
//!     this is the hub that battery-powered sensor nodes report to. a relay
//!     collects readings over the radio link and posts them here in batches.
//!     the hub drops readings it has already recorded and appends the rest
//!     to a per-device log and a combined log.
//!
//! responsibilities:
//!     - load hub.toml and install the tracing subscriber
//!     - pick the storage backend (file or memory)
//!     - serve the ingest endpoint until ctrl-c / sigterm
//!
//! relationships:
//!     - uses: server.rs (routes, handlers, shared state)
//!     - uses: processor.rs (dedup + append per reading)
//!     - uses: sequence_store.rs, record_log.rs (durable state)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    telemetry hub (this file)                 │
//!     │  ┌─────────────┐        ┌──────────────────────────────┐    │
//!     │  │ web server  │ ─────> │ batch processor              │    │
//!     │  │ (port 3000) │        │ (one mutex per device id)    │    │
//!     │  └─────────────┘        └──────┬─────────────────┬─────┘    │
//!     │                                │                 │          │
//!     │                        ┌───────┴──────┐  ┌───────┴──────┐   │
//!     │                        │ sequence     │  │ record log   │   │
//!     │                        │ store (.seq) │  │ (.csv)       │   │
//!     │                        └──────────────┘  └──────────────┘   │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

mod config;
mod domain;
mod error;
mod processor;
mod record_log;
mod sequence_store;
mod server;

use anyhow::{Context, Result};
use config::{HubConfig, StorageBackend};
use processor::BatchProcessor;
use record_log::{FileRecordLog, MemoryRecordLog, RecordLog};
use sequence_store::{FileSequenceStore, MemorySequenceStore, SequenceStore};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration
    let (config, config_note) = HubConfig::load_or_default();

    // step 2: logging. RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    tracing::info!("===========================================================");
    tracing::info!("  Telemetry Hub - batch ingest with per-device dedup");
    tracing::info!("===========================================================");
    tracing::info!("[CONFIG] {}", config_note);
    config.log_summary();

    // step 3: storage backend
    let (sequences, log) = open_storage(&config)?;
    let processor = BatchProcessor::new(sequences, log)
        .with_show_readings(config.logging.show_readings);

    // step 4: serve until asked to stop
    let state = server::AppState::new(processor, config.storage.backend.as_str());
    if let Err(e) = server::run_server(
        &config.listen_addr(),
        state,
        &config.server.legacy_path,
        shutdown_signal(),
    )
    .await
    {
        tracing::error!("[ERROR] Web server error: {:#}", e);
        return Err(e);
    }

    tracing::info!("[SHUTDOWN] ingest endpoint stopped");
    Ok(())
}

fn open_storage(config: &HubConfig) -> Result<(Arc<dyn SequenceStore>, Arc<dyn RecordLog>)> {
    match config.storage.backend {
        StorageBackend::File => {
            let dir = &config.storage.data_dir;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data dir {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "[STARTUP] ✓ File storage ready");
            let sequences: Arc<dyn SequenceStore> =
                Arc::new(FileSequenceStore::new(dir, &config.storage.prefix));
            let log: Arc<dyn RecordLog> = Arc::new(FileRecordLog::new(dir, &config.storage.prefix));
            Ok((sequences, log))
        }
        StorageBackend::Memory => {
            tracing::warn!("[STARTUP] Using MEMORY storage - nothing survives a restart");
            let sequences: Arc<dyn SequenceStore> = Arc::new(MemorySequenceStore::new());
            let log: Arc<dyn RecordLog> = Arc::new(MemoryRecordLog::new());
            Ok((sequences, log))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[SHUTDOWN] failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("[SHUTDOWN] failed to listen for sigterm: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("[SHUTDOWN] signal received, draining requests");
}
