//! Supervised live relays from nodes to browser viewers.
//!
//! Each viewer gets its own upstream connection to the node's `/api/stream`.
//! When the upstream refuses, errors or ends, the relay waits with a
//! bounded exponential backoff and reconnects; it only stops when the
//! viewer goes away.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

/// Connection state of a node's live relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    #[default]
    Idle,
    Connecting,
    Live,
    Reconnecting,
}

/// Snapshot reported by `GET /api/feeds`.
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub node: String,
    pub state: FeedState,
    pub viewers: usize,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct FeedInner {
    state: FeedState,
    viewers: usize,
    reconnects: u64,
}

/// Per-node relay status shared by all of that node's viewers.
#[derive(Debug, Default)]
pub struct FeedStatus {
    inner: Mutex<FeedInner>,
}

impl FeedStatus {
    fn lock(&self) -> std::sync::MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join(self: &Arc<Self>) -> ViewerGuard {
        self.lock().viewers += 1;
        ViewerGuard(self.clone())
    }

    fn set(&self, state: FeedState) {
        let mut inner = self.lock();
        if state == FeedState::Reconnecting {
            inner.reconnects += 1;
        }
        inner.state = state;
    }

    pub fn report(&self, node: &str) -> FeedReport {
        let inner = self.lock();
        FeedReport {
            node: node.to_string(),
            state: inner.state,
            viewers: inner.viewers,
            reconnects: inner.reconnects,
        }
    }
}

/// Counts one viewer for as long as its relay lives.
struct ViewerGuard(Arc<FeedStatus>);

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let mut inner = self.0.lock();
        inner.viewers = inner.viewers.saturating_sub(1);
        if inner.viewers == 0 {
            inner.state = FeedState::Idle;
        }
    }
}

/// Doubling reconnect delay, clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// The delay to wait now; the following one is twice as long.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

enum Phase {
    Connect,
    Live(BoxStream<'static, reqwest::Result<Bytes>>),
    Wait,
}

struct Relay {
    client: reqwest::Client,
    label: String,
    url: String,
    backoff: Backoff,
    status: Arc<FeedStatus>,
    phase: Phase,
    /// Set once any upstream body has been relayed.
    resumed: bool,
    _viewer: ViewerGuard,
}

async fn connect(
    client: &reqwest::Client,
    url: &str,
) -> Result<BoxStream<'static, reqwest::Result<Bytes>>> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        bail!("GET {url} returned {}", resp.status());
    }
    Ok(resp.bytes_stream().boxed())
}

/// Relay node `url` to one viewer, reconnecting until the returned stream
/// is dropped.
///
/// A resumed upstream is preceded by a bare CRLF so that a part cut short
/// by the outage is terminated before the next boundary line.
pub fn supervise(
    client: reqwest::Client,
    label: String,
    url: String,
    backoff: Backoff,
    status: Arc<FeedStatus>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    let relay = Relay {
        client,
        label,
        url,
        backoff,
        _viewer: status.join(),
        status,
        phase: Phase::Connect,
        resumed: false,
    };

    stream::unfold(relay, |mut relay| async move {
        loop {
            match std::mem::replace(&mut relay.phase, Phase::Wait) {
                Phase::Connect => {
                    if !relay.resumed {
                        relay.status.set(FeedState::Connecting);
                    }
                    match connect(&relay.client, &relay.url).await {
                        Ok(body) => {
                            info!("Live relay from {} connected", relay.label);
                            relay.status.set(FeedState::Live);
                            relay.backoff.reset();
                            relay.phase = Phase::Live(body);
                            if relay.resumed {
                                return Some((Ok(Bytes::from_static(b"\r\n")), relay));
                            }
                            relay.resumed = true;
                        }
                        Err(e) => warn!("Live relay from {}: {e:#}", relay.label),
                    }
                }
                Phase::Live(mut body) => match body.next().await {
                    Some(Ok(chunk)) => {
                        relay.phase = Phase::Live(body);
                        return Some((Ok(chunk), relay));
                    }
                    Some(Err(e)) => warn!("Live relay from {} interrupted: {e}", relay.label),
                    None => info!("Live relay from {} ended upstream", relay.label),
                },
                Phase::Wait => {
                    relay.status.set(FeedState::Reconnecting);
                    let delay = relay.backoff.next();
                    info!("Live relay from {} reconnecting in {delay:?}", relay.label);
                    tokio::time::sleep(delay).await;
                    relay.phase = Phase::Connect;
                }
            }
        }
    })
}
