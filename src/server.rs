use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::catalog::WorkCatalog;
use crate::registry::WorkerRegistry;
use crate::session::SessionTable;

/// Completion report POSTed by a worker when it finishes a job. Everything
/// besides the session id is carried through opaquely to the result consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub session_id: Uuid,
    #[serde(flatten)]
    pub detail: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<WorkerRegistry>,
    pub sessions: Arc<SessionTable>,
    pub catalog: Arc<WorkCatalog>,
    pub results: mpsc::UnboundedSender<CompletionReport>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/processing_status", get(processing_status))
        .route("/api/v1/processing_complete", post(processing_complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the token is cancelled.
pub async fn run_server(addr: SocketAddr, state: ApiState, cancel: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting coordinator API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

/// Liveness stub.
async fn processing_status() -> &'static str {
    "hi"
}

/// Worker callback: resolve the session, persist completion, forward the
/// report downstream and return the worker to the ready pool.
///
/// A report for a session that was already resolved (or never existed) gets
/// an explicit 404 rather than a silent drop; nothing else is mutated.
async fn processing_complete(
    State(state): State<ApiState>,
    Json(report): Json<CompletionReport>,
) -> impl IntoResponse {
    let session_id = report.session_id;
    let Some(session) = state.sessions.resolve(&session_id).await else {
        tracing::warn!(session_id = %session_id, "Completion for unknown session");
        return (StatusCode::NOT_FOUND, "unknown session");
    };

    let catalog = state.catalog.clone();
    let payload = session.payload.clone();
    let write_back = tokio::task::spawn_blocking(move || catalog.mark_stitched(&payload)).await;
    match write_back {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            tracing::warn!(session_id = %session_id, "Completed item missing from catalog")
        }
        Ok(Err(e)) => {
            tracing::error!(session_id = %session_id, error = %e, "Catalog write-back failed")
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Catalog write-back panicked")
        }
    }

    // Receiver only drops at shutdown.
    let _ = state.results.send(report);
    state.registry.release(&session.worker).await;
    tracing::info!(session_id = %session_id, worker = %session.worker, "Job completed");
    (StatusCode::ACCEPTED, "complete")
}
