//! Lifetime of the shell child behind a host connection.
//!
//! Each shell (`/bin/sh` or `ssh`) runs in its own session, so stopping it also stops
//! whatever the agent started underneath: `awk`, `gzip`, a `journalctl` follower.

use std::fmt;
#[cfg(unix)]
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Time a shell gets to exit after SIGTERM before its session is killed.
pub const SHELL_STOP_GRACE: Duration = Duration::from_secs(2);

/// How a host shell ended once we asked it to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellExit {
    /// The shell was already gone, e.g. ssh lost the connection.
    AlreadyExited(ExitStatus),
    /// The session went away within the grace period.
    Terminated(ExitStatus),
    /// The session ignored SIGTERM and was killed.
    Killed(Option<ExitStatus>),
}

impl ShellExit {
    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            Self::AlreadyExited(status) | Self::Terminated(status) => Some(*status),
            Self::Killed(status) => *status,
        }
    }
}

impl fmt::Display for ShellExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExited(status) => write!(f, "shell had already exited ({status})"),
            Self::Terminated(status) => write!(f, "shell stopped ({status})"),
            Self::Killed(Some(status)) => write!(f, "shell killed after ignoring SIGTERM ({status})"),
            Self::Killed(None) => f.write_str("shell killed, exit status unknown"),
        }
    }
}

/// Starts the shell as a session leader so that [`stop_shell`] reaches its descendants.
#[cfg(unix)]
pub fn detach_session(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn detach_session(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_session(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_session(_child: &Child, _signal: i32) {}

#[cfg(unix)]
const SIGNAL_TERMINATE: i32 = libc::SIGTERM;
#[cfg(not(unix))]
const SIGNAL_TERMINATE: i32 = 15;

#[cfg(unix)]
const SIGNAL_KILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGNAL_KILL: i32 = 9;

/// Stops the shell session of `host`: SIGTERM first, SIGKILL once `grace` runs out.
pub async fn stop_shell(child: &mut Child, host: &str, grace: Duration) -> ShellExit {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(event = "shell.stop.already_exited", host = %host, status = %status);
        return ShellExit::AlreadyExited(status);
    }
    signal_session(child, SIGNAL_TERMINATE);
    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
        return ShellExit::Terminated(status);
    }
    warn!(
        event = "shell.stop.escalate",
        host = %host,
        pid = ?child.id(),
        grace_ms = grace.as_millis() as u64,
        "shell ignored SIGTERM, killing its session"
    );
    signal_session(child, SIGNAL_KILL);
    let _ = child.kill().await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => ShellExit::Killed(status.ok()),
        Err(_) => ShellExit::Killed(None),
    }
}
