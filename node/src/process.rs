//! Child-process teardown: graceful terminate, then kill.

use std::io;
use std::process::Child;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const EXIT_POLL: Duration = Duration::from_millis(20);

/// How a child ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    AlreadyExited,
    Terminated,
    Killed,
}

/// Stop `child`: SIGTERM, wait up to `grace`, then SIGKILL.  The child is
/// always reaped before returning `Ok`.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<Teardown> {
    if child.try_wait()?.is_some() {
        return Ok(Teardown::AlreadyExited);
    }

    send_sigterm(child);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            debug!("pid {} exited after SIGTERM ({status})", child.id());
            return Ok(Teardown::Terminated);
        }
        std::thread::sleep(EXIT_POLL);
    }

    warn!(
        "pid {} ignored SIGTERM for {:.1}s, killing",
        child.id(),
        grace.as_secs_f64()
    );
    child.kill()?;
    child.wait()?;
    Ok(Teardown::Killed)
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // a child we have not reaped yet, so it cannot have been recycled.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            "SIGTERM to pid {} failed: {}",
            child.id(),
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &Child) {
    debug!("no SIGTERM on this platform for pid {}", child.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_terminate_cooperative_child() {
        let mut child = spawn_sh("exec sleep 30");
        let started = Instant::now();
        let outcome = terminate(&mut child, Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Teardown::Terminated);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_terminate_stubborn_child_is_killed() {
        let mut child = spawn_sh("trap '' TERM; exec sleep 30");
        // Let the shell install the trap before signalling it.
        std::thread::sleep(Duration::from_millis(100));
        let outcome = terminate(&mut child, Duration::from_millis(200)).unwrap();
        assert_eq!(outcome, Teardown::Killed);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_terminate_exited_child() {
        let mut child = spawn_sh("exit 0");
        child.wait().unwrap();
        assert_eq!(
            terminate(&mut child, Duration::from_millis(100)).unwrap(),
            Teardown::AlreadyExited
        );
    }
}
