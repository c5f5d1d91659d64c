//! ssh plumbing for host shells: the option set, password hand-off and readable failures.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Environment variable the askpass script reads the configured password from.
pub const PASSWORD_ENV: &str = "LOGFLEET_SSH_PASS";

const ASKPASS_FILE: &str = "ssh-askpass.sh";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$LOGFLEET_SSH_PASS\"\n";
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Options for a non-interactive host shell; user arguments and the destination follow them.
pub fn ssh_args(port: Option<u16>, jumphost: Option<&str>, has_password: bool) -> Vec<String> {
    let mut args = vec!["-T".to_string()];
    let mut option = |value: String| {
        args.push("-o".to_string());
        args.push(value);
    };
    option("StrictHostKeyChecking=accept-new".to_string());
    option(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"));
    option("ServerAliveInterval=15".to_string());
    if has_password {
        // A rejected password fails the attempt instead of prompting again.
        option("NumberOfPasswordPrompts=1".to_string());
    } else {
        option("BatchMode=yes".to_string());
    }
    if let Some(jumphost) = jumphost {
        args.push("-J".to_string());
        args.push(jumphost.to_string());
    }
    if let Some(port) = port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    args
}

/// Writes the askpass helper into `dir` unless an identical one is already there.
pub fn ensure_askpass_script(dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(ASKPASS_FILE);
    let current = std::fs::read(&path).ok();
    if current.as_deref() != Some(ASKPASS_SCRIPT.as_bytes()) {
        std::fs::write(&path, ASKPASS_SCRIPT)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to make {} executable", path.display()))?;
    }
    Ok(path)
}

/// Environment that makes ssh read `password` from the askpass script without a terminal.
pub fn askpass_env(script: &Path, password: &str) -> Vec<(&'static str, String)> {
    vec![
        (PASSWORD_ENV, password.to_string()),
        ("SSH_ASKPASS", script.to_string_lossy().into_owned()),
        ("SSH_ASKPASS_REQUIRE", "force".to_string()),
        ("DISPLAY", "logfleet:0".to_string()),
    ]
}

/// Steps of opening a host shell, reported as connect progress.
#[derive(Debug, Clone, Copy)]
pub enum ConnectStep<'a> {
    /// `destination` is `None` for the local shell.
    Spawn {
        destination: Option<&'a str>,
        jumphost: Option<&'a str>,
    },
    AwaitShell { destination: Option<&'a str> },
}

impl fmt::Display for ConnectStep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Spawn { destination: None, .. } => f.write_str("starting local shell"),
            Self::Spawn {
                destination: Some(destination),
                jumphost: None,
            } => write!(f, "connecting to {destination}"),
            Self::Spawn {
                destination: Some(destination),
                jumphost: Some(jumphost),
            } => write!(f, "connecting to {destination} via {jumphost}"),
            Self::AwaitShell { destination: None } => f.write_str("waiting for local shell"),
            Self::AwaitShell {
                destination: Some(destination),
            } => write!(f, "waiting for remote shell on {destination}"),
        }
    }
}

/// What went wrong when ssh exited before the shell came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshFailure {
    HostKeyChanged,
    InteractiveAuth,
    AuthRejected,
    Unresolvable,
    Unreachable,
    Other,
}

impl SshFailure {
    pub fn classify(stderr: &str) -> Self {
        let stderr = stderr.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| stderr.contains(needle));
        if has(&["remote host identification has changed", "host key verification failed"]) {
            Self::HostKeyChanged
        } else if has(&["keyboard-interactive", "verification code", "two-factor"]) {
            Self::InteractiveAuth
        } else if has(&[
            "permission denied",
            "authentication failed",
            "no supported authentication methods available",
            "too many authentication failures",
        ]) {
            Self::AuthRejected
        } else if has(&["could not resolve hostname", "name or service not known"]) {
            Self::Unresolvable
        } else if has(&[
            "connection refused",
            "connection timed out",
            "no route to host",
            "network is unreachable",
        ]) {
            Self::Unreachable
        } else {
            Self::Other
        }
    }

    fn hint(self, has_password: bool) -> Option<&'static str> {
        match self {
            Self::HostKeyChanged => Some(
                "the host key differs from known_hosts; verify the host, then remove the stale entry",
            ),
            Self::InteractiveAuth => Some(
                "the server wants keyboard-interactive or 2FA login, which logfleet cannot answer; use key auth",
            ),
            Self::AuthRejected if has_password => Some("the configured ssh_password was rejected"),
            Self::AuthRejected => Some(
                "load a key into ssh-agent, or set ssh_password in the logfleet config if password login is allowed",
            ),
            Self::Unresolvable => Some("check the host's `ssh` address in the logfleet config"),
            Self::Unreachable | Self::Other => None,
        }
    }
}

/// Connect error for `host`, built from whatever ssh printed before it exited.
pub fn describe_connect_failure(host: &str, stderr: &str, has_password: bool) -> String {
    let detail = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("Warning: Permanently added"))
        .last()
        .unwrap_or_default();
    let mut message = if detail.is_empty() {
        format!("{host}: shell exited before it was ready")
    } else {
        format!("{host}: {detail}")
    };
    if let Some(hint) = SshFailure::classify(stderr).hint(has_password) {
        message.push_str(" (");
        message.push_str(hint);
        message.push(')');
    }
    message
}
