//! Precision scheduling of a still capture.
//!
//! A trigger names an absolute wall-clock instant.  The node sleeps until
//! just before it, spins through the last few milliseconds, lets the sensor
//! settle, then takes the camera and fires the still utility.  The outcome
//! becomes the acknowledgement; nothing is retried, since by the time a
//! failure is known the synchronized instant has passed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};

use camsync_common::artifact;
use camsync_common::protocol::{unix_now, Ack, TriggerCommand};

use crate::arbiter::CameraArbiter;
use crate::camera::Camera;

/// Below this much remaining time the wait stops sleeping and spins.
const SPIN_MARGIN: f64 = 0.010;

pub struct Scheduler {
    pub arbiter: Arc<CameraArbiter>,
    pub camera: Arc<dyn Camera>,
    pub save_dir: PathBuf,
    pub settle: Duration,
    pub default_prefix: String,
}

impl Scheduler {
    /// Wait for the command's instant, capture, and describe the result.
    pub fn schedule_and_capture(&self, cmd: &TriggerCommand, source: SocketAddr) -> Ack {
        info!(
            "Trigger from {source}, shoot in {:.3}s, prefix={}",
            cmd.scheduled_at - unix_now(),
            cmd.prefix
        );

        wait_until(cmd.scheduled_at);
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }

        let path = artifact::capture_path(
            &self.save_dir,
            &cmd.prefix,
            &self.default_prefix,
            Local::now(),
        );

        let _camera = self.arbiter.acquire_for_capture();
        match self.camera.capture_still(&path) {
            Ok(()) => {
                info!("Captured: {}", path.display());
                Ack::success(path.display().to_string())
            }
            Err(e) => {
                error!("Capture failed: {e}");
                Ack::failure(e.to_string())
            }
        }
    }
}

/// Block until wall-clock time reaches `target` (Unix seconds).
///
/// Sleeps until within [`SPIN_MARGIN`] of the target, then spins, so the
/// return is never early and rarely more than a scheduler tick late.  A
/// target that is NaN or too far away to sleep towards returns at once.
pub fn wait_until(target: f64) {
    loop {
        let remaining = target - unix_now();
        if remaining.is_nan() || remaining <= 0.0 {
            return;
        }
        if remaining > SPIN_MARGIN {
            match Duration::try_from_secs_f64(remaining - SPIN_MARGIN) {
                Ok(nap) => std::thread::sleep(nap),
                Err(e) => {
                    warn!("Cannot wait {remaining}s for target {target}: {e}");
                    return;
                }
            }
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::CaptureError;
    use std::io;
    use std::path::Path;
    use std::process::Child;
    use std::sync::Mutex;

    /// Camera that records when it fired and writes a stub JPEG.
    #[derive(Default)]
    pub(crate) struct FakeCamera {
        pub fired_at: Mutex<Vec<f64>>,
        pub fail_with: Option<String>,
    }

    impl Camera for FakeCamera {
        fn capture_still(&self, output: &Path) -> Result<(), CaptureError> {
            self.fired_at.lock().unwrap().push(unix_now());
            if let Some(msg) = &self.fail_with {
                return Err(CaptureError::Missing {
                    program: msg.clone(),
                    path: output.display().to_string(),
                });
            }
            std::fs::write(output, [0xff, 0xd8, 0xff, 0xd9]).unwrap();
            Ok(())
        }

        fn spawn_stream(&self) -> io::Result<Child> {
            Err(io::Error::other("no stream in tests"))
        }
    }

    pub(crate) fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("camsync_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn scheduler(camera: Arc<FakeCamera>, dir: PathBuf, settle: Duration) -> Scheduler {
        Scheduler {
            arbiter: Arc::new(CameraArbiter::new(Duration::from_secs(1))),
            camera,
            save_dir: dir,
            settle,
            default_prefix: "capture".into(),
        }
    }

    fn source() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_wait_until_is_never_early() {
        for lead in [0.0, 0.005, 0.03, 0.12] {
            let target = unix_now() + lead;
            wait_until(target);
            let now = unix_now();
            assert!(now >= target);
            assert!(now - target < 0.03, "late by {}", now - target);
        }
    }

    #[test]
    fn test_wait_until_unreachable_target_returns_immediately() {
        let started = std::time::Instant::now();
        for target in [1e20, f64::MAX, f64::INFINITY, f64::NAN] {
            wait_until(target);
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_wait_until_past_target_returns_immediately() {
        let started = std::time::Instant::now();
        wait_until(unix_now() - 10.0);
        assert!(started.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_capture_fires_after_target_plus_settle() {
        let camera = Arc::new(FakeCamera::default());
        let dir = test_dir("sched_ok");
        let settle = Duration::from_millis(120);
        let sched = scheduler(camera.clone(), dir.clone(), settle);

        let cmd = TriggerCommand::after(Duration::from_millis(300), "rig");
        let ack = sched.schedule_and_capture(&cmd, source());

        let fired = camera.fired_at.lock().unwrap()[0];
        let earliest = cmd.scheduled_at + settle.as_secs_f64();
        assert!(fired >= earliest, "fired {:.4}s early", earliest - fired);
        assert!(fired < earliest + 0.05, "fired {:.4}s late", fired - earliest);

        assert!(ack.is_success());
        let path = PathBuf::from(&ack.detail);
        assert_eq!(path.parent(), Some(dir.as_path()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rig_") && name.ends_with(".jpg"), "{name}");
        assert!(path.is_file());
    }

    #[test]
    fn test_failure_becomes_negative_ack() {
        let camera = Arc::new(FakeCamera {
            fail_with: Some("rpicam-jpeg".into()),
            ..Default::default()
        });
        let sched = scheduler(camera.clone(), test_dir("sched_fail"), Duration::ZERO);
        let cmd = TriggerCommand::after(Duration::ZERO, "x");
        let ack = sched.schedule_and_capture(&cmd, source());
        assert!(!ack.is_success());
        assert!(ack.detail.contains("rpicam-jpeg"));
        // Exactly one attempt, no retry.
        assert_eq!(camera.fired_at.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_traversal_prefix_stays_in_save_dir() {
        let camera = Arc::new(FakeCamera::default());
        let dir = test_dir("sched_prefix");
        let sched = scheduler(camera, dir.clone(), Duration::ZERO);
        let cmd = TriggerCommand {
            scheduled_at: unix_now(),
            prefix: "../../etc/evil".into(),
        };
        let ack = sched.schedule_and_capture(&cmd, source());
        assert!(ack.is_success());
        assert_eq!(PathBuf::from(&ack.detail).parent(), Some(dir.as_path()));
    }
}
