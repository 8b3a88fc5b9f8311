//! Live view: one `rpicam-vid` per viewer, demultiplexed into frames and
//! pushed to the HTTP response as multipart parts.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::arbiter::CameraArbiter;
use crate::camera::Camera;
use crate::mjpeg::{self, MjpegFrames};

/// Start a live feed for one viewer.
///
/// The returned receiver yields multipart parts.  It closes when the stream
/// utility exits or is preempted; dropping it stops the utility.
pub fn open(arbiter: Arc<CameraArbiter>, camera: Arc<dyn Camera>) -> mpsc::Receiver<Bytes> {
    // Capacity 1: at most one frame in flight per viewer.
    let (tx, rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || pump(&arbiter, camera.as_ref(), tx));
    rx
}

fn pump(arbiter: &CameraArbiter, camera: &dyn Camera, tx: mpsc::Sender<Bytes>) {
    let (lease, stdout) = match arbiter.acquire_for_streaming(|| camera.spawn_stream()) {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!("Cannot start live stream: {e}");
            return;
        }
    };
    info!("Live stream started");

    let mut sent = 0u64;
    for frame in MjpegFrames::new(stdout) {
        if tx.blocking_send(mjpeg::multipart_part(&frame)).is_err() {
            info!("Viewer disconnected after {sent} frames");
            break;
        }
        sent += 1;
    }

    drop(lease);
    info!("Live stream stopped ({sent} frames)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CaptureError;
    use std::io;
    use std::path::Path;
    use std::process::{Child, Command, Stdio};
    use std::time::Duration;

    /// Streams a fixed script's stdout instead of a camera.
    struct ScriptCamera(&'static str);

    impl Camera for ScriptCamera {
        fn capture_still(&self, _output: &Path) -> Result<(), CaptureError> {
            unreachable!("still capture not used by stream tests")
        }

        fn spawn_stream(&self) -> io::Result<Child> {
            Command::new("sh")
                .args(["-c", self.0])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_are_pushed_as_parts() {
        let arbiter = Arc::new(CameraArbiter::new(Duration::from_secs(1)));
        // Two tiny JPEGs then EOF.
        let camera = Arc::new(ScriptCamera(
            r"printf 'junk\377\330AB\377\331\377\330CD\377\331'",
        ));
        let mut rx = open(arbiter, camera);

        let first = rx.recv().await.unwrap();
        assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(first.ends_with(b"\xff\xd8AB\xff\xd9\r\n"));
        let second = rx.recv().await.unwrap();
        assert!(second.ends_with(b"\xff\xd8CD\xff\xd9\r\n"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_failure_closes_feed() {
        struct Broken;
        impl Camera for Broken {
            fn capture_still(&self, _: &Path) -> Result<(), CaptureError> {
                unreachable!()
            }
            fn spawn_stream(&self) -> io::Result<Child> {
                Err(io::Error::other("no camera"))
            }
        }
        let arbiter = Arc::new(CameraArbiter::new(Duration::from_secs(1)));
        let mut rx = open(arbiter, Arc::new(Broken));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_preempts_live_feed() {
        let arbiter = Arc::new(CameraArbiter::new(Duration::from_secs(1)));
        // One frame, then hold the camera until stopped.
        let camera = Arc::new(ScriptCamera(
            r"printf '\377\330AB\377\331'; exec sleep 30",
        ));
        let mut rx = open(arbiter.clone(), camera);
        assert!(rx.recv().await.is_some());

        let guard = {
            let arbiter = arbiter.clone();
            tokio::task::spawn_blocking(move || {
                let _guard = arbiter.acquire_for_capture();
            })
        };
        guard.await.unwrap();

        // The stream process was torn down, so the feed ends.
        let end = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(end, Ok(None)));
    }
}
