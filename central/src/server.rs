//! Central HTTP API: one view over every node.
//!
//! Routes:
//!   GET  /api/health                      → health check
//!   GET  /api/nodes                       → inventory of every node
//!   GET  /api/nodes/{idx}/images/{name}   → proxied still
//!   GET  /api/nodes/{idx}/stream          → supervised live relay
//!   GET  /api/feeds                       → relay state per node
//!   POST /api/trigger?prefix=&lead=       → synchronized shot on all nodes
//!   GET  /api/acks                        → recent acknowledgements

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use camsync_common::protocol::{HealthResponse, NodeInventory};

use crate::acks::{AckLog, AckRecord};
use crate::aggregator::{Aggregator, FetchError};
use crate::feed::FeedReport;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub acks: Arc<AckLog>,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{idx}/images/{name}", get(node_image))
        .route("/api/nodes/{idx}/stream", get(node_stream))
        .route("/api/feeds", get(feeds))
        .route("/api/trigger", post(trigger))
        .route("/api/acks", get(acks))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Central HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeInventory>> {
    Json(state.aggregator.inventory().await)
}

async fn node_image(
    State(state): State<AppState>,
    Path((idx, name)): Path<(usize, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    match state.aggregator.fetch_image(idx, &name).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], Body::from(bytes))),
        Err(FetchError::UnknownNode | FetchError::BadName) => Err(StatusCode::BAD_REQUEST),
        Err(FetchError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(FetchError::Upstream(e)) => {
            warn!("Image {name} from node {idx}: {e}");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn node_stream(
    State(state): State<AppState>,
    Path(idx): Path<usize>,
) -> Result<Response, StatusCode> {
    let feed = state
        .aggregator
        .live_feed(idx)
        .ok_or(StatusCode::BAD_REQUEST)?;

    Ok((
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(feed),
    )
        .into_response())
}

async fn feeds(State(state): State<AppState>) -> Json<Vec<FeedReport>> {
    Json(state.aggregator.feed_status())
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    prefix: Option<String>,
    /// Seconds ahead of now.
    lead: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerResponse {
    scheduled_at: f64,
    prefix: String,
    sent: usize,
    failed: Vec<String>,
}

async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> Result<Json<TriggerResponse>, (StatusCode, String)> {
    let lead = params
        .lead
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid lead {secs}: {e}")))
        })
        .transpose()?;

    let report = state
        .aggregator
        .trigger(params.prefix.as_deref(), lead)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;

    Ok(Json(TriggerResponse {
        scheduled_at: report.scheduled_at,
        prefix: report.prefix,
        sent: report.sent.len(),
        failed: report.failed,
    }))
}

async fn acks(State(state): State<AppState>) -> Json<Vec<AckRecord>> {
    Json(state.acks.recent())
}
