//! Collection of capture acknowledgements sent back by nodes.
//!
//! Acks carry no trigger identifier, so they are attributed to a node by
//! source address only and kept in a small ring for the UI.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use camsync_common::protocol::{Ack, AckOutcome};

use crate::nodes::NodeEndpoint;

/// Acks kept by the central service.
pub const ACK_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct AckRecord {
    pub from: SocketAddr,
    /// Configured label of the sending node, when its address is known.
    pub node: Option<String>,
    pub outcome: AckOutcome,
    pub detail: String,
    pub received_at: DateTime<Local>,
}

impl AckRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == AckOutcome::Success
    }

    /// The node label, or the source address for unknown senders.
    pub fn sender(&self) -> String {
        self.node.clone().unwrap_or_else(|| self.from.ip().to_string())
    }
}

/// Bounded, newest-first log of received acks.
pub struct AckLog {
    entries: Mutex<VecDeque<AckRecord>>,
    capacity: usize,
}

impl AckLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: AckRecord) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(record);
    }

    pub fn recent(&self) -> Vec<AckRecord> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }
}

/// Receives ack datagrams on the controller's ack port.
pub struct AckCollector {
    socket: UdpSocket,
    nodes: Vec<NodeEndpoint>,
}

impl AckCollector {
    pub async fn bind(port: u16, nodes: Vec<NodeEndpoint>) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Cannot bind ack port {port}"))?;
        Ok(Self { socket, nodes })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for the next acknowledgement.
    pub async fn next(&self) -> std::io::Result<AckRecord> {
        let mut buf = [0u8; 2048];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let ack = Ack::parse(&buf[..len]);
        let node = self
            .nodes
            .iter()
            .find(|n| n.matches_ip(from.ip()))
            .map(|n| n.label.clone());

        Ok(AckRecord {
            from,
            node,
            outcome: ack.outcome,
            detail: ack.detail,
            received_at: Local::now(),
        })
    }

    /// Log every ack into `log` until the socket fails.
    pub async fn run(self, log: std::sync::Arc<AckLog>) {
        info!("Collecting acks on {:?}", self.local_addr().ok());
        loop {
            match self.next().await {
                Ok(record) => {
                    if record.is_success() {
                        info!("Ack from {}: ok ({})", record.sender(), record.detail);
                    } else {
                        warn!("Ack from {}: FAILED ({})", record.sender(), record.detail);
                    }
                    log.push(record);
                }
                Err(e) => {
                    warn!("Ack socket error: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(detail: &str) -> AckRecord {
        AckRecord {
            from: "127.0.0.1:5005".parse().unwrap(),
            node: None,
            outcome: AckOutcome::Success,
            detail: detail.into(),
            received_at: Local::now(),
        }
    }

    #[test]
    fn test_log_is_bounded_newest_first() {
        let log = AckLog::new(3);
        for i in 0..5 {
            log.push(record(&i.to_string()));
        }
        let details: Vec<String> = log.recent().into_iter().map(|r| r.detail).collect();
        assert_eq!(details, ["4", "3", "2"]);
    }

    #[tokio::test]
    async fn test_collector_attributes_by_address() {
        let nodes = vec![NodeEndpoint::parse("127.0.0.1", 8080)];
        let collector = AckCollector::bind(0, nodes).await.unwrap();
        let port = collector.local_addr().unwrap().port();

        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        node.send_to(b"ok:/home/pi/captures/a.jpg", ("127.0.0.1", port))
            .await
            .unwrap();
        node.send_to(b"fail:camera busy", ("127.0.0.1", port))
            .await
            .unwrap();

        let first = collector.next().await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.node.as_deref(), Some("127.0.0.1"));
        assert_eq!(first.detail, "/home/pi/captures/a.jpg");

        let second = collector.next().await.unwrap();
        assert!(!second.is_success());
        assert_eq!(second.detail, "camera busy");
        assert_eq!(second.sender(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_unknown_sender() {
        let collector = AckCollector::bind(0, Vec::new()).await.unwrap();
        let port = collector.local_addr().unwrap().port();
        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        node.send_to(b"garbage", ("127.0.0.1", port)).await.unwrap();

        let rec = collector.next().await.unwrap();
        assert_eq!(rec.node, None);
        assert_eq!(rec.outcome, AckOutcome::Failure);
        assert!(rec.detail.contains("garbage"));
    }
}
