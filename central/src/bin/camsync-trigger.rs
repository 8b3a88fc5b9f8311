//! One-shot synchronized capture from the command line.
//!
//! ```text
//! camsync-trigger [config] [prefix]
//! ```
//!
//! Sends one trigger to every configured node, then reports each node's
//! acknowledgement.  Exits non-zero when any node reports a failure.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tokio::time::Instant;

use camsync_central::acks::AckCollector;
use camsync_central::aggregator::{Aggregator, AggregatorConfig};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .unwrap_or_else(|| camsync_common::config::Config::default_path().to_string());
    let prefix = args.next();

    let config = camsync_common::config::load(&PathBuf::from(&config_path))
        .context("Config load failed")?;
    let agg_config = AggregatorConfig::from_config(&config);
    if agg_config.nodes.is_empty() {
        anyhow::bail!("No nodes configured (NODES is empty in {config_path})");
    }
    let nodes = agg_config.nodes.clone();

    // Bind before sending so no early ack is lost.
    let collector = AckCollector::bind(config.ack_port, nodes.clone()).await?;
    let aggregator = Aggregator::new(agg_config)?;
    let report = aggregator.trigger(prefix.as_deref(), None).await?;

    println!(
        "Trigger '{}' for t={:.3} sent to {} node(s)",
        report.prefix,
        report.scheduled_at,
        report.sent.len()
    );
    for node in &report.failed {
        println!("  {node}: not sent");
    }

    let mut pending: HashSet<String> = report.sent.iter().cloned().collect();
    let mut failures = report.failed.len();
    let deadline = Instant::now() + config.ack_wait;

    while !pending.is_empty() {
        let Ok(received) = tokio::time::timeout_at(deadline, collector.next()).await else {
            break;
        };
        let record = received.context("Ack socket error")?;
        if let Some(node) = &record.node {
            pending.remove(node);
        }
        if record.is_success() {
            println!("  {}: ok {}", record.sender(), record.detail);
        } else {
            failures += 1;
            println!("  {}: FAILED {}", record.sender(), record.detail);
        }
    }

    for node in nodes.iter().filter(|n| pending.contains(&n.label)) {
        println!("  {}: no acknowledgement", node.label);
    }

    Ok(if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
