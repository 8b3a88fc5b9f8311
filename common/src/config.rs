//! Configuration parsing – reads a KEY=VALUE file (`camsync.conf`).
//!
//! The node, the central aggregator and the trigger tool all load the same
//! file; each ignores the keys it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Prefix used for capture filenames when a trigger carries none.
pub const DEFAULT_PREFIX: &str = "capture";

/// Application configuration, shared between node and central services.
#[derive(Debug, Clone)]
pub struct Config {
    // ── identity / storage (node) ────────────────────────────────────
    pub node_name: String,
    pub save_dir: PathBuf,

    // ── trigger protocol ─────────────────────────────────────────────
    pub trigger_port: u16,
    pub ack_port: u16,
    pub send_ack: bool,
    pub default_prefix: String,
    /// Lead applied by a node when a trigger carries no usable timestamp.
    pub default_delay: Duration,
    /// Pause between the scheduled instant and the shutter release.
    pub settle: Duration,

    // ── still capture (node) ─────────────────────────────────────────
    pub still_command: String,
    pub still_width: u32,
    pub still_height: u32,
    pub jpeg_quality: u8,

    // ── live stream (node) ───────────────────────────────────────────
    pub stream_command: String,
    pub stream_width: u32,
    pub stream_height: u32,
    pub stream_fps: u32,
    /// How long a camera consumer gets to exit after SIGTERM.
    pub stop_grace: Duration,

    // ── node HTTP ────────────────────────────────────────────────────
    pub web_enabled: bool,
    pub node_listen_addr: String,

    // ── central aggregator ───────────────────────────────────────────
    /// Node addresses, `host` or `host:port`.
    pub nodes: Vec<String>,
    pub node_http_port: u16,
    pub central_listen_addr: String,
    pub inventory_timeout: Duration,
    pub stream_timeout: Duration,
    /// How far ahead of "now" the controller schedules a shot.
    pub trigger_lead: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub ack_wait: Duration,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/camsync/camsync.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        parse("")
    }
}

/// Load and parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let config = parse(&text);
    info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Build a [`Config`] from file contents, falling back to defaults for
/// missing or unparsable values.
pub fn parse(text: &str) -> Config {
    let map = parse_conf(text);

    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|v| !v.is_empty()) };
    let get_u16 = |key: &str, default: u16| -> u16 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str, default: bool| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    };
    let get_secs = |key: &str, default: f64| -> Duration {
        let secs = get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .unwrap_or(default);
        Duration::from_micros((secs * 1e6).round() as u64)
    };
    let get_millis = |key: &str, default: u64| -> Duration {
        Duration::from_millis(get(key).and_then(|v| v.parse().ok()).unwrap_or(default))
    };

    let nodes: Vec<String> = get("NODES")
        .map(|s| {
            s.split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Config {
        node_name: get("NODE_NAME").unwrap_or_else(system_hostname),
        save_dir: PathBuf::from(get("SAVE_DIR").unwrap_or_else(|| "/home/pi/captures".into())),

        trigger_port: get_u16("TRIGGER_PORT", 5005),
        ack_port: get_u16("ACK_PORT", 5006),
        send_ack: get_bool("SEND_ACK", true),
        default_prefix: get("DEFAULT_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.into()),
        default_delay: get_secs("DEFAULT_DELAY_SECS", 0.8),
        settle: get_secs("SETTLE_SECS", 0.12),

        still_command: get("STILL_COMMAND").unwrap_or_else(|| "rpicam-jpeg".into()),
        still_width: get_u32("STILL_WIDTH", 4056),
        still_height: get_u32("STILL_HEIGHT", 3040),
        jpeg_quality: get("JPEG_QUALITY")
            .and_then(|v| v.parse::<u8>().ok())
            .map(|q| q.min(100))
            .unwrap_or(95),

        stream_command: get("STREAM_COMMAND").unwrap_or_else(|| "rpicam-vid".into()),
        stream_width: get_u32("STREAM_WIDTH", 1280),
        stream_height: get_u32("STREAM_HEIGHT", 720),
        stream_fps: get_u32("STREAM_FPS", 15),
        stop_grace: get_secs("STOP_GRACE_SECS", 2.0),

        web_enabled: get_bool("WEB_ENABLED", true),
        node_listen_addr: get("NODE_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),

        nodes,
        node_http_port: get_u16("NODE_HTTP_PORT", 8080),
        central_listen_addr: get("CENTRAL_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8081".into()),
        inventory_timeout: get_secs("INVENTORY_TIMEOUT_SECS", 3.0),
        stream_timeout: get_secs("STREAM_TIMEOUT_SECS", 10.0),
        trigger_lead: get_secs("TRIGGER_LEAD_SECS", 0.3),
        reconnect_min: get_millis("RECONNECT_MIN_MS", 500),
        reconnect_max: get_millis("RECONNECT_MAX_MS", 3000),
        ack_wait: get_secs("ACK_WAIT_SECS", 5.0),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

fn system_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "camsync-node".into())
}

// ─── tests ───────────────────────────────────────────────────────────────
