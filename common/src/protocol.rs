//! Wire formats shared by nodes and the controller.
//!
//! Two tiny ASCII datagram protocols carry the synchronized-capture traffic:
//!
//! ```text
//! controller → node   shoot
//!                     shoot:<unix-seconds>
//!                     shoot:<unix-seconds>:<prefix>
//! node → controller   ok:<artifact path>
//!                     fail:<message>
//! ```
//!
//! The HTTP side (inventory, health) uses the JSON types at the bottom of
//! this module.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const SHOOT: &str = "shoot";

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── trigger ──────────────────────────────────────────────────────────────

/// A request to capture a still at an absolute wall-clock instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerCommand {
    /// Absolute target instant, fractional Unix seconds.
    pub scheduled_at: f64,
    pub prefix: String,
}

impl TriggerCommand {
    /// Schedule a shot `lead` from now.
    pub fn after(lead: Duration, prefix: &str) -> Self {
        Self {
            scheduled_at: unix_now() + lead.as_secs_f64(),
            prefix: prefix.to_string(),
        }
    }

    /// Encode as `shoot:<t>:<prefix>`.
    ///
    /// `f64`'s `Display` is the shortest round-tripping representation, so a
    /// node parses back exactly the instant the controller chose.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{SHOOT}:{}:{}", self.scheduled_at, self.prefix).into_bytes()
    }

    /// Decode a trigger datagram received now.
    ///
    /// Returns `None` for anything that does not start with `shoot`.  A
    /// missing, malformed or unreachably distant timestamp resolves to
    /// `now + default_delay`; a missing or empty prefix resolves to
    /// `default_prefix`.
    pub fn parse(data: &[u8], default_delay: Duration, default_prefix: &str) -> Option<Self> {
        Self::parse_at(data, unix_now(), default_delay, default_prefix)
    }

    /// [`TriggerCommand::parse`] against an explicit "now".
    pub fn parse_at(
        data: &[u8],
        now: f64,
        default_delay: Duration,
        default_prefix: &str,
    ) -> Option<Self> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim();
        if !text.starts_with(SHOOT) {
            return None;
        }

        let mut fields = text.split(':').skip(1);
        let fallback = now + default_delay.as_secs_f64();

        let scheduled_at = fields
            .next()
            .and_then(|t| t.trim().parse::<f64>().ok())
            .filter(|t| {
                t.is_finite() && Duration::try_from_secs_f64((t - now).max(0.0)).is_ok()
            })
            .unwrap_or(fallback);

        let prefix = fields
            .next()
            .filter(|p| !p.is_empty())
            .unwrap_or(default_prefix)
            .to_string();

        Some(Self {
            scheduled_at,
            prefix,
        })
    }
}

// ── acknowledgement ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Success,
    Failure,
}

/// Result of one capture attempt, sent back to the controller.
///
/// Acks carry no trigger identifier; the controller correlates them by
/// source address and arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub outcome: AckOutcome,
    /// Artifact path on success, error text on failure.
    pub detail: String,
}

impl Ack {
    pub fn success(path: impl Into<String>) -> Self {
        Self {
            outcome: AckOutcome::Success,
            detail: path.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: AckOutcome::Failure,
            detail: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AckOutcome::Success
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let tag = match self.outcome {
            AckOutcome::Success => "ok",
            AckOutcome::Failure => "fail",
        };
        format!("{tag}:{}", self.detail).into_bytes()
    }

    /// Decode an acknowledgement datagram.
    ///
    /// Anything that is neither `ok:` nor `fail:` is reported as a failure
    /// carrying the raw text, so a garbled ack is never mistaken for a shot.
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let text = text.trim();
        match text.split_once(':') {
            Some(("ok", detail)) => Self::success(detail),
            Some(("fail", detail)) => Self::failure(detail),
            _ if text == "ok" => Self::success(""),
            _ if text == "fail" => Self::failure(""),
            _ => Self::failure(format!("unrecognised acknowledgement: {text}")),
        }
    }
}

impl std::fmt::Display for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.outcome {
            AckOutcome::Success => write!(f, "ok ({})", self.detail),
            AckOutcome::Failure => write!(f, "FAILED ({})", self.detail),
        }
    }
}

// ── HTTP types ───────────────────────────────────────────────────────────

/// Reply to a node's inventory query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResponse {
    pub hostname: String,
    /// Artifact names, newest first.
    pub images: Vec<String>,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// One node as seen by the central aggregator during a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInventory {
    pub address: String,
    pub online: bool,
    /// Node-reported hostname, or the address when offline.
    pub display_name: String,
    pub images: Vec<String>,
}

impl NodeInventory {
    pub fn offline(address: &str) -> Self {
        Self {
            address: address.to_string(),
            online: false,
            display_name: address.to_string(),
            images: Vec::new(),
        }
    }
}
