//! HTTP server exposing captured stills and the live feed.
//!
//! Routes:
//!   GET  /api/health          → health check
//!   GET  /api/images          → node name + artifact names, newest first
//!   GET  /api/images/{name}   → download one artifact
//!   GET  /api/stream          → live multipart MJPEG feed

use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use camsync_common::artifact::{self, ARTIFACT_EXT};
use camsync_common::protocol::{HealthResponse, InventoryResponse};

use crate::arbiter::CameraArbiter;
use crate::camera::Camera;
use crate::{mjpeg, stream};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub node_name: String,
    pub save_dir: PathBuf,
    pub arbiter: Arc<CameraArbiter>,
    pub camera: Arc<dyn Camera>,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/images", get(list_images))
        .route("/api/images/{name}", get(download_image))
        .route("/api/stream", get(live_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(state: AppState, listen_addr: &str, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Node HTTP server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
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

async fn list_images(
    State(state): State<AppState>,
) -> Result<Json<InventoryResponse>, StatusCode> {
    let dir = state.save_dir.clone();
    let images = tokio::task::spawn_blocking(move || list_artifacts(&dir))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            warn!("Cannot list {}: {e}", state.save_dir.display());
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(InventoryResponse {
        hostname: state.node_name.clone(),
        images,
    }))
}

/// `*.jpg` names in `dir`, newest first (ties broken by name, descending).
fn list_artifacts(dir: &FsPath) -> std::io::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut found: Vec<(SystemTime, String)> = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXT) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, entry.file_name().to_string_lossy().into_owned()));
    }

    found.sort_by(|a, b| b.cmp(a));
    Ok(found.into_iter().map(|(_, name)| name).collect())
}

async fn download_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let file_path =
        artifact::resolve(&state.save_dir, &name).map_err(|_| StatusCode::BAD_REQUEST)?;

    let bytes = match tokio::fs::read(&file_path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], Body::from(bytes)))
}

async fn live_stream(State(state): State<AppState>) -> Response {
    let parts = stream::open(state.arbiter.clone(), state.camera.clone());
    let body = Body::from_stream(
        ReceiverStream::new(parts).map(Ok::<_, std::convert::Infallible>),
    );

    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}
