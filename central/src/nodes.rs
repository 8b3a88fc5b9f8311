//! Statically configured node addresses.

use std::net::{IpAddr, SocketAddr};

/// One camera node as listed in `NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// The entry as configured, used as the node's address in reports.
    pub label: String,
    pub host: String,
    pub http_port: u16,
}

impl NodeEndpoint {
    /// Parse `host`, `host:port`, `ip`, `ip:port` or `[v6]:port`.
    pub fn parse(entry: &str, default_port: u16) -> Self {
        let label = entry.trim().to_string();

        if let Ok(sa) = label.parse::<SocketAddr>() {
            return Self {
                host: sa.ip().to_string(),
                http_port: sa.port(),
                label,
            };
        }
        if let Ok(ip) = label.parse::<IpAddr>() {
            return Self {
                host: ip.to_string(),
                http_port: default_port,
                label,
            };
        }
        if let Some((host, port)) = label.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                return Self {
                    host: host.to_string(),
                    http_port: port,
                    label,
                };
            }
        }
        Self {
            host: label.clone(),
            http_port: default_port,
            label,
        }
    }

    pub fn parse_all(entries: &[String], default_port: u16) -> Vec<Self> {
        entries.iter().map(|e| Self::parse(e, default_port)).collect()
    }

    pub fn base_url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("http://[{v6}]:{}", self.http_port),
            _ => format!("http://{}:{}", self.host, self.http_port),
        }
    }

    /// Whether a datagram from `ip` came from this node.  Only literal IP
    /// entries can match; hostnames are not resolved.
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.host.parse::<IpAddr>().is_ok_and(|h| h == ip)
    }
}
