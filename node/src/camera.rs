//! The external camera utilities, `rpicam-jpeg` and `rpicam-vid`.
//!
//! Both are opaque subprocesses.  The still utility writes one JPEG and
//! exits; the stream utility writes raw MJPEG to stdout until it is
//! stopped.

use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::debug;

use camsync_common::config::Config;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}{}", stderr_suffix(.stderr))]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{program} reported success but wrote no file at {path}")]
    Missing { program: String, path: String },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// A camera the node can drive.
///
/// Implementations only run the hardware; ownership is settled by the
/// caller through [`crate::arbiter::CameraArbiter`].
pub trait Camera: Send + Sync {
    /// Capture one still to `output`, blocking until done.
    fn capture_still(&self, output: &Path) -> Result<(), CaptureError>;

    /// Start a continuous MJPEG stream with stdout piped.
    fn spawn_stream(&self) -> io::Result<Child>;
}

/// Raspberry Pi `rpicam-*` apps.
#[derive(Debug, Clone)]
pub struct Rpicam {
    pub still_command: String,
    pub still_width: u32,
    pub still_height: u32,
    pub jpeg_quality: u8,
    pub stream_command: String,
    pub stream_width: u32,
    pub stream_height: u32,
    pub stream_fps: u32,
}

impl Rpicam {
    pub fn from_config(config: &Config) -> Self {
        Self {
            still_command: config.still_command.clone(),
            still_width: config.still_width,
            still_height: config.still_height,
            jpeg_quality: config.jpeg_quality,
            stream_command: config.stream_command.clone(),
            stream_width: config.stream_width,
            stream_height: config.stream_height,
            stream_fps: config.stream_fps,
        }
    }

    fn still_cmd(&self, output: &Path) -> Command {
        let mut cmd = Command::new(&self.still_command);
        cmd.arg("-o")
            .arg(output)
            .args(["--width", &self.still_width.to_string()])
            .args(["--height", &self.still_height.to_string()])
            .args(["-q", &self.jpeg_quality.to_string()])
            .arg("--nopreview")
            // minimal capture timeout (ms)
            .args(["-t", "1"]);
        cmd
    }

    fn stream_cmd(&self) -> Command {
        let mut cmd = Command::new(&self.stream_command);
        cmd.args(["-t", "0", "--codec", "mjpeg"])
            .args(["--width", &self.stream_width.to_string()])
            .args(["--height", &self.stream_height.to_string()])
            .args(["--framerate", &self.stream_fps.to_string()])
            .arg("--nopreview")
            .args(["-o", "-"]);
        cmd
    }
}

impl Camera for Rpicam {
    fn capture_still(&self, output: &Path) -> Result<(), CaptureError> {
        let program = self.still_command.clone();
        debug!("Running {program} -o {}", output.display());

        let out = self
            .still_cmd(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CaptureError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(CaptureError::Exit {
                program,
                status: out.status,
                stderr: last_line(&stderr).to_string(),
            });
        }
        if !output.is_file() {
            return Err(CaptureError::Missing {
                program,
                path: output.display().to_string(),
            });
        }
        Ok(())
    }

    fn spawn_stream(&self) -> io::Result<Child> {
        self.stream_cmd()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn rpicam(still: &str, stream: &str) -> Rpicam {
        Rpicam {
            still_command: still.into(),
            stream_command: stream.into(),
            ..Rpicam::from_config(&Config::default())
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_still_arguments() {
        let cam = rpicam("rpicam-jpeg", "rpicam-vid");
        let cmd = cam.still_cmd(Path::new("/tmp/a.jpg"));
        assert_eq!(cmd.get_program(), "rpicam-jpeg");
        assert_eq!(
            args(&cmd),
            [
                "-o", "/tmp/a.jpg", "--width", "4056", "--height", "3040", "-q", "95",
                "--nopreview", "-t", "1"
            ]
        );
    }

    #[test]
    fn test_stream_arguments() {
        let cam = rpicam("rpicam-jpeg", "rpicam-vid");
        assert_eq!(
            args(&cam.stream_cmd()),
            [
                "-t", "0", "--codec", "mjpeg", "--width", "1280", "--height", "720",
                "--framerate", "15", "--nopreview", "-o", "-"
            ]
        );
    }

    #[test]
    fn test_missing_utility_is_spawn_error() {
        let cam = rpicam("/nonexistent/rpicam-jpeg", "rpicam-vid");
        let err = cam
            .capture_still(&PathBuf::from("/tmp/never.jpg"))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/rpicam-jpeg"));
    }

    #[test]
    fn test_nonzero_exit_is_reported() {
        // `false` ignores its arguments and exits 1.
        let cam = rpicam("false", "rpicam-vid");
        let err = cam
            .capture_still(&PathBuf::from("/tmp/never.jpg"))
            .unwrap_err();
        assert!(matches!(err, CaptureError::Exit { .. }));
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("a\nERROR: no cameras\n\n"), "ERROR: no cameras");
        assert_eq!(last_line(""), "");
    }
}
