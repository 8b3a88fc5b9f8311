//! Fan-out of triggers to every node, fan-in of their inventories.
//!
//! Each node is polled independently with a short timeout.  A node that
//! times out or errors is reported offline for this refresh; the others are
//! unaffected.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use camsync_common::artifact;
use camsync_common::config::Config;
use camsync_common::protocol::{InventoryResponse, NodeInventory, TriggerCommand};

use crate::feed::{Backoff, FeedStatus};
use crate::nodes::NodeEndpoint;

/// Everything the aggregator needs, injected at construction.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub nodes: Vec<NodeEndpoint>,
    pub trigger_port: u16,
    pub default_prefix: String,
    pub trigger_lead: Duration,
    pub inventory_timeout: Duration,
    pub stream_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl AggregatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            nodes: NodeEndpoint::parse_all(&config.nodes, config.node_http_port),
            trigger_port: config.trigger_port,
            default_prefix: config.default_prefix.clone(),
            trigger_lead: config.trigger_lead,
            inventory_timeout: config.inventory_timeout,
            stream_timeout: config.stream_timeout,
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        }
    }
}

/// What a broadcast handed to the network.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub scheduled_at: f64,
    pub prefix: String,
    /// Nodes the datagram was sent to (not necessarily delivered).
    pub sent: Vec<String>,
    /// Nodes the datagram could not even be sent to.
    pub failed: Vec<String>,
}

/// Why an artifact could not be proxied.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchError {
    UnknownNode,
    BadName,
    NotFound,
    Upstream(String),
}

pub struct Aggregator {
    config: AggregatorConfig,
    /// Short-timeout client for inventory and artifact requests.
    client: reqwest::Client,
    /// Client for live feeds: bounded connect/read, no total timeout.
    stream_client: reqwest::Client,
    feeds: Vec<std::sync::Arc<FeedStatus>>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.inventory_timeout)
            .build()
            .context("Cannot create HTTP client")?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.stream_timeout)
            .read_timeout(config.stream_timeout)
            .build()
            .context("Cannot create streaming HTTP client")?;
        let feeds = config
            .nodes
            .iter()
            .map(|_| std::sync::Arc::new(FeedStatus::default()))
            .collect();

        Ok(Self {
            config,
            client,
            stream_client,
            feeds,
        })
    }

    pub fn nodes(&self) -> &[NodeEndpoint] {
        &self.config.nodes
    }

    pub fn node(&self, idx: usize) -> Option<&NodeEndpoint> {
        self.config.nodes.get(idx)
    }

    // ── fan-out ──────────────────────────────────────────────────────

    /// Send one trigger datagram to every node and return without waiting
    /// for acknowledgements.
    pub async fn trigger(&self, prefix: Option<&str>, lead: Option<Duration>) -> Result<TriggerReport> {
        // Nodes split the datagram on ':', so the prefix must not carry one.
        let prefix = artifact::sanitize_prefix(
            prefix.unwrap_or_default(),
            &self.config.default_prefix,
        );
        let cmd = TriggerCommand::after(lead.unwrap_or(self.config.trigger_lead), &prefix);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Cannot bind trigger socket")?;
        let report = broadcast(&socket, &self.config.nodes, self.config.trigger_port, &cmd).await;
        info!(
            "Trigger '{}' for t={:.3} sent to {}/{} node(s)",
            report.prefix,
            report.scheduled_at,
            report.sent.len(),
            self.config.nodes.len()
        );
        Ok(report)
    }

    // ── inventory fan-in ─────────────────────────────────────────────

    /// Poll every node; unreachable ones come back `online: false`.
    pub async fn inventory(&self) -> Vec<NodeInventory> {
        join_all(self.config.nodes.iter().map(|node| self.node_inventory(node))).await
    }

    async fn node_inventory(&self, node: &NodeEndpoint) -> NodeInventory {
        match self.fetch_inventory(node).await {
            Ok(inv) => NodeInventory {
                address: node.label.clone(),
                online: true,
                display_name: if inv.hostname.is_empty() {
                    node.label.clone()
                } else {
                    inv.hostname
                },
                images: inv.images,
            },
            Err(e) => {
                warn!("Node {} offline: {e:#}", node.label);
                NodeInventory::offline(&node.label)
            }
        }
    }

    async fn fetch_inventory(&self, node: &NodeEndpoint) -> Result<InventoryResponse> {
        let url = format!("{}/api/images", node.base_url());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("GET {url} returned {}", resp.status());
        }

        resp.json().await.context("Parse inventory JSON")
    }

    // ── artifact proxy ───────────────────────────────────────────────

    /// Fetch one still from node `idx`.  The name is validated before any
    /// request leaves this process.
    pub async fn fetch_image(&self, idx: usize, name: &str) -> Result<Bytes, FetchError> {
        let node = self.node(idx).ok_or(FetchError::UnknownNode)?;
        let name = artifact::validate_name(name).map_err(|_| FetchError::BadName)?;

        let url = format!("{}/api/images/{name}", node.base_url());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Upstream(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => resp
                .bytes()
                .await
                .map_err(|e| FetchError::Upstream(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            s => Err(FetchError::Upstream(format!("GET {url} returned {s}"))),
        }
    }

    // ── live feeds ───────────────────────────────────────────────────

    /// A supervised live relay from node `idx` for one viewer.
    pub fn live_feed(
        &self,
        idx: usize,
    ) -> Option<impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static> {
        let node = self.node(idx)?;
        let status = self.feeds.get(idx)?.clone();
        debug!("Opening live relay to {}", node.label);
        Some(crate::feed::supervise(
            self.stream_client.clone(),
            node.label.clone(),
            format!("{}/api/stream", node.base_url()),
            Backoff::new(self.config.reconnect_min, self.config.reconnect_max),
            status,
        ))
    }

    pub fn feed_status(&self) -> Vec<crate::feed::FeedReport> {
        self.config
            .nodes
            .iter()
            .zip(&self.feeds)
            .map(|(node, status)| status.report(&node.label))
            .collect()
    }
}

/// Send `cmd` to each node's trigger port.  Failures are logged per node and
/// never stop the remaining sends.
pub async fn broadcast(
    socket: &UdpSocket,
    nodes: &[NodeEndpoint],
    port: u16,
    cmd: &TriggerCommand,
) -> TriggerReport {
    let payload = cmd.to_bytes();
    let mut report = TriggerReport {
        scheduled_at: cmd.scheduled_at,
        prefix: cmd.prefix.clone(),
        sent: Vec::new(),
        failed: Vec::new(),
    };

    for node in nodes {
        match socket.send_to(&payload, (node.host.as_str(), port)).await {
            Ok(_) => report.sent.push(node.label.clone()),
            Err(e) => {
                warn!("Cannot send trigger to {}: {e}", node.label);
                report.failed.push(node.label.clone());
            }
        }
    }
    report
}
