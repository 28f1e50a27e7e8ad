// timeout.rs - Bounded waits on child processes.
//
// A child that outlives its limit is asked to stop with SIGTERM, given a
// short grace period, then killed. Children are spawned as process group
// leaders (`spawn_in_group`), so the signals reach everything they started.
// The group id stays reserved while the leader is unreaped or any member
// is alive.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Spawn `command` as the leader of a new process group.
pub fn spawn_in_group(command: &mut Command) -> io::Result<Child> {
    command.process_group(0).spawn()
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) {
    // SAFETY: kill(2) on a negative pid addresses the process group; no
    // memory is shared with the callee.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pgid, signal, error = %err, "signalling process group failed");
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Wait for `child` up to `limit`; on expiry terminate it and reap it.
pub fn wait_with_timeout(child: &mut Child, limit: Duration) -> io::Result<WaitOutcome> {
    if let Some(status) = wait_until(child, Instant::now() + limit)? {
        return Ok(WaitOutcome::Exited(status));
    }
    tracing::info!(pid = child.id(), ?limit, "child timed out, terminating");
    graceful_terminate(child, TERMINATE_GRACE)?;
    Ok(WaitOutcome::TimedOut)
}

/// SIGTERM to the child's process group, wait up to `grace`, then SIGKILL
/// to the group. Always reaps the child.
pub fn graceful_terminate(child: &mut Child, grace: Duration) -> io::Result<()> {
    let pgid = match libc::pid_t::try_from(child.id()) {
        Ok(pgid) => pgid,
        Err(_) => {
            child.kill()?;
            child.wait()?;
            return Ok(());
        }
    };
    signal_group(pgid, libc::SIGTERM);
    let exited = wait_until(child, Instant::now() + grace)?.is_some();
    if !exited {
        tracing::warn!(pgid, "child ignored SIGTERM, killing");
    }
    // Stragglers in the group get SIGKILL even when the leader went quietly.
    signal_group(pgid, libc::SIGKILL);
    if !exited {
        child.wait()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn fast_child_exits_normally() {
        let mut child = spawn_in_group(Command::new("/bin/sh").args(["-c", "exit 3"])).unwrap();
        match wait_with_timeout(&mut child, Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            WaitOutcome::TimedOut => panic!("should not time out"),
        }
    }

    #[test]
    fn slow_child_is_terminated() {
        let mut child = spawn_in_group(Command::new("/bin/sh").args(["-c", "sleep 30"])).unwrap();
        let started = Instant::now();
        let outcome = wait_with_timeout(&mut child, Duration::from_millis(200)).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn sigterm_ignoring_child_is_killed() {
        let mut child =
            spawn_in_group(Command::new("/bin/sh").args(["-c", "trap '' TERM; sleep 30"])).unwrap();
        thread::sleep(Duration::from_millis(100));
        graceful_terminate(&mut child, Duration::from_millis(200)).unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn grandchildren_are_terminated_with_the_child() {
        use std::io::Read;
        use std::process::Stdio;

        // The backgrounded sleep inherits stdout; EOF means it is gone.
        let mut child = spawn_in_group(
            Command::new("/bin/sh")
                .args(["-c", "sleep 30 & wait"])
                .stdout(Stdio::piped()),
        )
        .unwrap();
        let mut stdout = child.stdout.take().unwrap();

        let started = Instant::now();
        let outcome = wait_with_timeout(&mut child, Duration::from_millis(200)).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut));

        let mut rest = Vec::new();
        stdout.read_to_end(&mut rest).unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
