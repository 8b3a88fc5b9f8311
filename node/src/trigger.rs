//! UDP trigger listener.
//!
//! One datagram in, at most one capture and one acknowledgement out.  The
//! capture runs on the listener thread itself: a node has one camera, so a
//! second trigger arriving mid-shot simply waits in the socket buffer.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use camsync_common::protocol::{Ack, TriggerCommand};

use crate::scheduler::Scheduler;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TriggerListener {
    pub socket: UdpSocket,
    pub scheduler: Scheduler,
    pub default_delay: Duration,
    /// Controller port acknowledgements go to; `None` disables them.
    pub ack_port: Option<u16>,
}

impl TriggerListener {
    pub fn bind(
        port: u16,
        scheduler: Scheduler,
        default_delay: Duration,
        ack_port: Option<u16>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .with_context(|| format!("Cannot bind trigger port {port}"))?;
        Ok(Self {
            socket,
            scheduler,
            default_delay,
            ack_port,
        })
    }

    /// Receive and serve triggers until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        self.socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("Cannot set trigger socket timeout")?;
        info!("Listening for triggers on UDP {}", self.socket.local_addr()?);

        let mut buf = [0u8; 1024];
        while !shutdown.load(Ordering::Relaxed) {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("Trigger socket receive failed: {e}");
                    continue;
                }
            };

            let Some(cmd) = TriggerCommand::parse(
                &buf[..len],
                self.default_delay,
                &self.scheduler.default_prefix,
            ) else {
                debug!("Ignoring {len}-byte datagram from {from}");
                continue;
            };

            let ack = self.scheduler.schedule_and_capture(&cmd, from);
            self.send_ack(from, &ack);
        }

        info!("Trigger listener stopped");
        Ok(())
    }

    /// Best effort: a lost ack is the controller's problem to notice.
    fn send_ack(&self, to: SocketAddr, ack: &Ack) {
        let Some(port) = self.ack_port else {
            return;
        };
        let dest = SocketAddr::new(to.ip(), port);
        if let Err(e) = self.socket.send_to(&ack.to_bytes(), dest) {
            warn!("Cannot send ack to {dest}: {e}");
        }
    }
}
