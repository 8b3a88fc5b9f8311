//! Camera ownership arbitration.
//!
//! The sensor can be driven by one process at a time: either the live
//! stream utility or the still capture utility.  [`CameraArbiter`] is the
//! single owner of that fact for the whole node.  Every transition runs
//! under one lock, including tearing down the previous consumer and
//! starting the next one.
//!
//! ```text
//! Idle ──► Streaming ──► Idle
//!   │          │
//!   │          ▼ (capture preempts stream)
//!   └────► Capturing ──► Idle
//! ```

use std::io;
use std::process::{Child, ChildStdout};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::process::{self, Teardown};

enum CameraState {
    Idle,
    Streaming { lease: u64, child: Child },
    Capturing,
}

pub struct CameraArbiter {
    state: Mutex<CameraState>,
    /// Signalled whenever the camera leaves `Capturing`.
    released: Condvar,
    grace: Duration,
    next_lease: AtomicU64,
}

impl CameraArbiter {
    /// `grace` bounds how long a preempted consumer may take to exit
    /// after SIGTERM before it is killed.
    pub fn new(grace: Duration) -> Self {
        Self {
            state: Mutex::new(CameraState::Idle),
            released: Condvar::new(),
            grace,
            next_lease: AtomicU64::new(1),
        }
    }

    /// Take the camera for a still capture.
    ///
    /// A running stream is stopped first; a capture already in progress is
    /// waited out.  The camera returns to idle when the guard drops.
    pub fn acquire_for_capture(&self) -> CaptureGuard<'_> {
        let mut state = self.wait_while_capturing();

        if matches!(*state, CameraState::Streaming { .. }) {
            let previous = std::mem::replace(&mut *state, CameraState::Idle);
            info!("Still capture requested – stopping live stream");
            self.teardown(previous);
        }

        *state = CameraState::Capturing;
        debug!("camera: capturing");
        CaptureGuard { arbiter: self }
    }

    fn release_from_capture(&self) {
        let mut state = self.lock();
        if matches!(*state, CameraState::Capturing) {
            *state = CameraState::Idle;
            debug!("camera: idle");
        }
        drop(state);
        self.released.notify_all();
    }

    /// Take the camera for a live stream started by `spawn`.
    ///
    /// Any previous stream is stopped before `spawn` runs, so reconnecting
    /// viewers never accumulate camera-owning processes.  `spawn` must pipe
    /// the child's stdout.
    pub fn acquire_for_streaming<F>(&self, spawn: F) -> io::Result<(StreamLease<'_>, ChildStdout)>
    where
        F: FnOnce() -> io::Result<Child>,
    {
        let mut state = self.wait_while_capturing();

        if matches!(*state, CameraState::Streaming { .. }) {
            let previous = std::mem::replace(&mut *state, CameraState::Idle);
            info!("New live stream requested – replacing the previous one");
            self.teardown(previous);
        }

        let mut child = spawn()?;
        let Some(stdout) = child.stdout.take() else {
            self.teardown(CameraState::Streaming { lease: 0, child });
            return Err(io::Error::other("stream utility spawned without a stdout pipe"));
        };

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        info!("camera: streaming (lease {lease}, pid {})", child.id());
        *state = CameraState::Streaming { lease, child };

        Ok((StreamLease { arbiter: self, lease }, stdout))
    }

    fn release_stream(&self, lease: u64) {
        let mut state = self.lock();
        match &*state {
            CameraState::Streaming { lease: current, .. } if *current == lease => {
                let previous = std::mem::replace(&mut *state, CameraState::Idle);
                self.teardown(previous);
                debug!("camera: idle (lease {lease} released)");
            }
            _ => debug!("stream lease {lease} already superseded"),
        }
    }

    /// Stop whatever stream is running, for process shutdown.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if matches!(*state, CameraState::Streaming { .. }) {
            let previous = std::mem::replace(&mut *state, CameraState::Idle);
            self.teardown(previous);
        }
    }

    fn wait_while_capturing(&self) -> MutexGuard<'_, CameraState> {
        let mut state = self.lock();
        while matches!(*state, CameraState::Capturing) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    /// Stop the consumer owned by `previous`.  Failure to stop it is logged
    /// and otherwise ignored: the next acquisition goes ahead regardless.
    fn teardown(&self, previous: CameraState) {
        let CameraState::Streaming { lease, mut child } = previous else {
            return;
        };
        let pid = child.id();
        match process::terminate(&mut child, self.grace) {
            Ok(Teardown::Killed) => warn!("Stream (lease {lease}, pid {pid}) had to be killed"),
            Ok(outcome) => debug!("Stream (lease {lease}, pid {pid}) stopped: {outcome:?}"),
            Err(e) => warn!("Cannot stop stream (lease {lease}, pid {pid}): {e} – continuing"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn phase(&self) -> &'static str {
        match *self.lock() {
            CameraState::Idle => "idle",
            CameraState::Streaming { .. } => "streaming",
            CameraState::Capturing => "capturing",
        }
    }
}

/// Exclusive still-capture ownership; releases the camera on drop.
pub struct CaptureGuard<'a> {
    arbiter: &'a CameraArbiter,
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.arbiter.release_from_capture();
    }
}

/// Live-stream ownership.  Dropping it stops the stream process unless a
/// later acquisition already did.
pub struct StreamLease<'a> {
    arbiter: &'a CameraArbiter,
    lease: u64,
}

impl Drop for StreamLease<'_> {
    fn drop(&mut self) {
        self.arbiter.release_stream(self.lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    fn spawn_sleeper() -> io::Result<Child> {
        Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
    }

    fn is_alive(pid: u32) -> bool {
        // SAFETY: signal 0 only probes for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn test_capture_from_idle() {
        let arbiter = CameraArbiter::new(Duration::from_secs(1));
        assert_eq!(arbiter.phase(), "idle");
        {
            let _guard = arbiter.acquire_for_capture();
            assert_eq!(arbiter.phase(), "capturing");
        }
        assert_eq!(arbiter.phase(), "idle");
    }

    #[test]
    fn test_capture_preempts_stream() {
        let arbiter = CameraArbiter::new(Duration::from_secs(1));
        let mut pid = 0;
        let (lease, _stdout) = arbiter
            .acquire_for_streaming(|| {
                let child = spawn_sleeper()?;
                pid = child.id();
                Ok(child)
            })
            .unwrap();
        assert_eq!(arbiter.phase(), "streaming");
        assert!(is_alive(pid));

        let guard = arbiter.acquire_for_capture();
        assert_eq!(arbiter.phase(), "capturing");
        // Stream consumer was stopped and reaped before capture began.
        assert!(!is_alive(pid));

        // The superseded lease must not disturb the capture.
        drop(lease);
        assert_eq!(arbiter.phase(), "capturing");
        drop(guard);
        assert_eq!(arbiter.phase(), "idle");
    }

    #[test]
    fn test_new_stream_replaces_old() {
        let arbiter = CameraArbiter::new(Duration::from_secs(1));
        let mut first_pid = 0;
        let (first, _a) = arbiter
            .acquire_for_streaming(|| {
                let child = spawn_sleeper()?;
                first_pid = child.id();
                Ok(child)
            })
            .unwrap();
        let mut second_pid = 0;
        let (second, _b) = arbiter
            .acquire_for_streaming(|| {
                let child = spawn_sleeper()?;
                second_pid = child.id();
                Ok(child)
            })
            .unwrap();

        assert!(!is_alive(first_pid));
        assert!(is_alive(second_pid));

        drop(first);
        assert_eq!(arbiter.phase(), "streaming");
        assert!(is_alive(second_pid));

        drop(second);
        assert_eq!(arbiter.phase(), "idle");
        assert!(!is_alive(second_pid));
    }

    #[test]
    fn test_stream_waits_for_capture() {
        let arbiter = Arc::new(CameraArbiter::new(Duration::from_secs(1)));
        let guard = arbiter.acquire_for_capture();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let arbiter = arbiter.clone();
            std::thread::spawn(move || {
                let (lease, _stdout) = arbiter.acquire_for_streaming(spawn_sleeper).unwrap();
                tx.send(Instant::now()).unwrap();
                drop(lease);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        let released_at = Instant::now();
        drop(guard);

        let started_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(started_at >= released_at);
        worker.join().unwrap();
        assert_eq!(arbiter.phase(), "idle");
    }

    #[test]
    fn test_spawn_failure_leaves_camera_idle() {
        let arbiter = CameraArbiter::new(Duration::from_secs(1));
        let result = arbiter.acquire_for_streaming(|| {
            Command::new("/nonexistent/rpicam-vid")
                .stdout(Stdio::piped())
                .spawn()
        });
        assert!(result.is_err());
        assert_eq!(arbiter.phase(), "idle");
    }

    #[test]
    fn test_shutdown_stops_stream() {
        let arbiter = CameraArbiter::new(Duration::from_secs(1));
        let mut pid = 0;
        let (lease, _stdout) = arbiter
            .acquire_for_streaming(|| {
                let child = spawn_sleeper()?;
                pid = child.id();
                Ok(child)
            })
            .unwrap();
        arbiter.shutdown();
        assert!(!is_alive(pid));
        assert_eq!(arbiter.phase(), "idle");
        drop(lease);
    }
}
