// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — the thin request layer in front of the stream gateway.
//!
//! Endpoints:
//!   POST   /api/streams            → {name, url}: start a stream
//!   DELETE /api/streams/{name}     → stop a stream (idempotent)
//!   GET    /api/streams            → list registered streams
//!   GET    /api/streams/{name}     → status + stats for one stream
//!   GET    /api/system             → system-wide stats
//!   GET    /hls/…                  → static playlists and segments

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::error::GatewayError;
use crate::gateway::StreamGateway;
use crate::registry::StreamStatus;

/// Shared state passed to all handlers.
pub struct AppState {
    pub gateway: StreamGateway,
}

#[derive(Deserialize)]
pub struct StartParams {
    name: String,
    url: String,
}

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let hls_root = state.gateway.hls_root().to_path_buf();
    Router::new()
        .route("/api/streams", post(handle_start).get(handle_list))
        .route("/api/streams/{name}", get(handle_stream).delete(handle_stop))
        .route("/api/system", get(handle_system))
        .nest_service("/hls", ServeDir::new(hls_root))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_start(
    State(state): State<Arc<AppState>>,
    axum::Json(params): axum::Json<StartParams>,
) -> impl IntoResponse {
    match state.gateway.start(&params.url, &params.name) {
        Ok(playlist) => (
            StatusCode::CREATED,
            axum::Json(serde_json::json!({
                "name": params.name,
                "playlist": playlist,
            })),
        ),
        Err(e) => {
            let code = match &e {
                GatewayError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
                GatewayError::InvalidStreamName(_) | GatewayError::InvalidUrl => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (code, axum::Json(serde_json::json!({ "error": e.to_string() })))
        }
    }
}

async fn handle_stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    state.gateway.stop(&name).await;
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "status": "stopped", "name": name })),
    )
}

async fn handle_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams = state.gateway.list();
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "total": streams.len(),
            "streams": streams,
        })),
    )
}

async fn handle_stream(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let status = state.gateway.status(&name);
    if status == StreamStatus::NotFound {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": format!("Stream '{}' not found", name) })),
        );
    }

    let stats = state.gateway.stats(&name);
    (
        StatusCode::OK,
        axum::Json(serde_json::json!({
            "name": name,
            "status": status,
            "stats": stats,
        })),
    )
}

async fn handle_system(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gateway.system_stats();
    (StatusCode::OK, axum::Json(serde_json::to_value(stats).unwrap_or_default()))
}
