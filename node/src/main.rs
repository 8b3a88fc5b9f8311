//! Camsync Node – fires the local camera on synchronized UDP triggers and
//! serves stills and a live feed over HTTP.
//!
//! This binary:
//! 1. Reads configuration from `camsync.conf`
//! 2. Runs the UDP trigger listener on a dedicated thread
//! 3. Runs an axum HTTP server for the central aggregator and browsers
//!
//! Both share one [`arbiter::CameraArbiter`], so a still capture always
//! wins over a live viewer.

mod arbiter;
mod camera;
mod mjpeg;
mod process;
mod scheduler;
mod server;
mod stream;
mod trigger;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::arbiter::CameraArbiter;
use crate::camera::{Camera, Rpicam};
use crate::scheduler::Scheduler;
use crate::trigger::TriggerListener;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| camsync_common::config::Config::default_path().to_string());
    let config = camsync_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    info!(
        "Camsync Node '{}' starting (trigger=udp:{}, save_dir={})",
        config.node_name,
        config.trigger_port,
        config.save_dir.display()
    );
    info!(
        "Still {}x{} q={}, stream {}x{}@{}fps",
        config.still_width,
        config.still_height,
        config.jpeg_quality,
        config.stream_width,
        config.stream_height,
        config.stream_fps
    );

    std::fs::create_dir_all(&config.save_dir)
        .with_context(|| format!("Cannot create {}", config.save_dir.display()))?;

    let arbiter = Arc::new(CameraArbiter::new(config.stop_grace));
    let camera: Arc<dyn Camera> = Arc::new(Rpicam::from_config(&config));

    // ── ctrl-c ───────────────────────────────────────────────────────
    {
        let arbiter = arbiter.clone();
        ctrlc::set_handler(move || {
            SHUTDOWN.store(true, Ordering::Relaxed);
            info!("Shutdown signal received");
            arbiter.shutdown();
            std::process::exit(0);
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── trigger listener ─────────────────────────────────────────────
    let listener = TriggerListener::bind(
        config.trigger_port,
        Scheduler {
            arbiter: arbiter.clone(),
            camera: camera.clone(),
            save_dir: config.save_dir.clone(),
            settle: config.settle,
            default_prefix: config.default_prefix.clone(),
        },
        config.default_delay,
        config.send_ack.then_some(config.ack_port),
    )?;
    let trigger_thread = std::thread::Builder::new()
        .name("trigger".into())
        .spawn(move || {
            if let Err(e) = listener.run(&SHUTDOWN) {
                tracing::error!("Trigger listener error: {e:#}");
            }
        })
        .context("Cannot spawn trigger thread")?;

    // ── HTTP server ──────────────────────────────────────────────────
    if config.web_enabled {
        let state = server::AppState {
            node_name: config.node_name.clone(),
            save_dir: config.save_dir.clone(),
            arbiter: arbiter.clone(),
            camera,
            start_time: Instant::now(),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        if let Err(e) = server::run(state, &config.node_listen_addr, shutdown).await {
            tracing::error!("HTTP server error: {e:#}");
        }
    } else {
        info!("Web service disabled");
        tokio::task::spawn_blocking(move || trigger_thread.join())
            .await
            .ok();
    }

    arbiter.shutdown();
    info!("Camsync Node stopped");
    Ok(())
}
