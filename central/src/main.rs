//! Camsync Central – one HTTP view over every camera node.
//!
//! This binary:
//! 1. Reads configuration from `camsync.conf`
//! 2. Collects capture acknowledgements on the ack port
//! 3. Serves the aggregated inventory, image proxy, live relays and the
//!    synchronized trigger over HTTP

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use camsync_central::acks::{AckCollector, AckLog, ACK_LOG_CAPACITY};
use camsync_central::aggregator::{Aggregator, AggregatorConfig};
use camsync_central::server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| camsync_common::config::Config::default_path().to_string());
    let config = camsync_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;

    let agg_config = AggregatorConfig::from_config(&config);
    if agg_config.nodes.is_empty() {
        warn!("No nodes configured (NODES is empty)");
    }
    for (idx, node) in agg_config.nodes.iter().enumerate() {
        info!("Node {idx}: {}", node.base_url());
    }
    let nodes = agg_config.nodes.clone();
    let aggregator = Arc::new(Aggregator::new(agg_config)?);

    let acks = Arc::new(AckLog::new(ACK_LOG_CAPACITY));
    match AckCollector::bind(config.ack_port, nodes).await {
        Ok(collector) => {
            tokio::spawn(collector.run(acks.clone()));
        }
        Err(e) => warn!("Acks will not be collected: {e:#}"),
    }

    let state = server::AppState {
        aggregator,
        acks,
        start_time: Instant::now(),
    };
    server::run(state, &config.central_listen_addr).await?;

    info!("Camsync Central stopped");
    Ok(())
}
