//! ==============================================================================
//! server.rs - http boundary of the hub
//! ==============================================================================
//!
//! routes:
//!     POST /api/telemetry   batch of readings in, `{"update": n}` out
//!     POST <legacy_path>    same handler, for firmware using the old path
//!     GET  /api/status      ingest counters since start
//!
//! the handler only validates the envelope (`count` numeric, `data` array).
//! everything per-reading happens in processor.rs on a blocking thread.
//!
//! ==============================================================================

use crate::domain::{BatchSummary, IngestRequest, IngestResponse};
use crate::error::ApiError;
use crate::processor::BatchProcessor;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const INGEST_PATH: &str = "/api/telemetry";
pub const STATUS_PATH: &str = "/api/status";

// ==============================================================================
// shared state
// ==============================================================================

/// counters reported by `GET /api/status`
#[derive(Clone, Default, Serialize, Debug)]
pub struct IngestStats {
    /// storage backend in use ("file" or "memory")
    pub backend: String,
    pub batches: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    /// batches aborted by a storage error
    pub failed_batches: u64,
    /// devices that have sent at least one well-formed reading
    pub known_devices: usize,
    /// unix timestamp (ms) of the last batch that accepted something
    pub last_update: u64,
}

impl IngestStats {
    fn record(&mut self, summary: &BatchSummary) {
        self.batches += 1;
        self.accepted += summary.accepted() as u64;
        self.duplicates += summary.duplicates() as u64;
        self.skipped += summary.skipped() as u64;
        if summary.accepted() > 0 {
            self.last_update = chrono::Utc::now().timestamp_millis().max(0) as u64;
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub processor: BatchProcessor,
    pub stats: Arc<RwLock<IngestStats>>,
}

impl AppState {
    pub fn new(processor: BatchProcessor, backend: &str) -> Self {
        let stats = IngestStats {
            backend: backend.to_string(),
            ..IngestStats::default()
        };
        Self {
            processor,
            stats: Arc::new(RwLock::new(stats)),
        }
    }
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router(state: AppState, legacy_path: &str) -> Router {
    let mut app = Router::new()
        .route(INGEST_PATH, post(ingest_handler))
        .route(STATUS_PATH, get(status_handler));

    if let Some(path) = legacy_route(legacy_path) {
        app = app.route(&path, post(ingest_handler));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// normalized legacy path, or None when disabled or clashing with a built-in route
fn legacy_route(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if path == INGEST_PATH || path == STATUS_PATH {
        tracing::warn!(%path, "[API] legacy path clashes with a built-in route, ignoring");
        return None;
    }
    Some(path)
}

pub async fn run_server(
    listen_addr: &str,
    state: AppState,
    legacy_path: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state, legacy_path);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "[STARTUP] ✓ Ingest endpoint live");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// ingest endpoint
/// POST /api/telemetry  {"count": n, "data": [{"id","seq","volt","temp","rssi"}, ...]}
pub async fn ingest_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<IngestResponse>, ApiError> {
    let request = IngestRequest::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "[API] rejected request");
        e
    })?;

    let entries = request.entries;
    let submitted = entries.len();
    let processor = state.processor.clone();
    let result = tokio::task::spawn_blocking(move || processor.process_batch(&entries))
        .await
        .map_err(|e| ApiError::Worker(e.to_string()))?;

    let mut stats = state.stats.write().await;
    match result {
        Ok(summary) => {
            stats.record(&summary);
            tracing::info!(
                reported = request.count,
                submitted,
                accepted = summary.accepted(),
                duplicates = summary.duplicates(),
                skipped = summary.skipped(),
                "[API] batch processed"
            );
            Ok(Json(IngestResponse {
                update: summary.accepted(),
            }))
        }
        Err(e) => {
            stats.failed_batches += 1;
            tracing::error!(error = %e, submitted, "[API] batch aborted by storage failure");
            Err(e.into())
        }
    }
}

/// json api endpoint for monitoring
pub async fn status_handler(State(state): State<AppState>) -> Json<IngestStats> {
    let mut stats = state.stats.read().await.clone();
    stats.known_devices = state.processor.known_devices();
    Json(stats)
}
