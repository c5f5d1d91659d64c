use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use system_utils::process::{detach_session, stop_shell, SHELL_STOP_GRACE};
use system_utils::ssh::{
    askpass_env, describe_connect_failure, ensure_askpass_script, ssh_args, ConnectStep,
};

use super::{ConnectProgress, ShellCloser, ShellConnection, ShellConnector};
use crate::model::LogStream;

const READY_MARKER: &str = "logfleet_shell_ready";

/// Opens shells as child processes: `/bin/sh` for `localhost`, the `ssh` binary otherwise.
#[derive(Debug, Clone, Default)]
pub struct ProcessConnector {
    pub ssh_args: Vec<String>,
    pub ssh_password: Option<String>,
    /// Ask for a password through a data request when none is configured.
    pub prompt_password: bool,
    /// Where the askpass helper is written; `~/.logfleet` when unset.
    pub askpass_dir: Option<PathBuf>,
}

impl ProcessConnector {
    async fn password(
        &self,
        stream: &LogStream,
        progress: &mpsc::Sender<ConnectProgress>,
    ) -> anyhow::Result<Option<String>> {
        if let Some(password) = self.ssh_password.clone() {
            return Ok(Some(password));
        }
        if !self.prompt_password {
            return Ok(None);
        }
        let (reply, answer) = oneshot::channel();
        let title = format!("ssh password for {}", stream.ssh_destination());
        progress
            .send(ConnectProgress::NeedData { title, reply })
            .await
            .context("nobody is listening for the password request")?;
        let password = answer.await.context("password request was dropped")?;
        Ok(Some(password))
    }

    fn askpass_dir(&self) -> PathBuf {
        self.askpass_dir.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".logfleet"))
                .unwrap_or_else(|| std::env::temp_dir().join("logfleet"))
        })
    }

    fn command(&self, stream: &LogStream, password: Option<&str>) -> anyhow::Result<Command> {
        if stream.is_local() {
            return Ok(Command::new("/bin/sh"));
        }
        let mut cmd = Command::new("ssh");
        cmd.args(ssh_args(stream.port, stream.jumphost.as_deref(), password.is_some()));
        cmd.args(&self.ssh_args);
        cmd.arg(stream.ssh_destination());
        cmd.arg("/bin/sh");
        if let Some(password) = password {
            let script = ensure_askpass_script(&self.askpass_dir())?;
            cmd.envs(askpass_env(&script, password));
        }
        Ok(cmd)
    }
}

#[async_trait]
impl ShellConnector for ProcessConnector {
    async fn connect(
        &self,
        stream: &LogStream,
        progress: mpsc::Sender<ConnectProgress>,
    ) -> anyhow::Result<ShellConnection> {
        let password = self.password(stream, &progress).await?;
        let mut cmd = self.command(stream, password.as_deref())?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        detach_session(&mut cmd);

        let destination = (!stream.is_local()).then(|| stream.ssh_destination());
        let destination = destination.as_deref();
        let spawn = ConnectStep::Spawn {
            destination,
            jumphost: stream.jumphost.as_deref(),
        };
        let _ = progress.send(ConnectProgress::Message(spawn.to_string())).await;
        let mut child = cmd
            .spawn()
            .with_context(|| format!("{}: failed to spawn shell", stream.name))?;
        let mut stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        let mut stderr = child.stderr.take().context("child stderr unavailable")?;

        stdin
            .write_all(format!("echo {READY_MARKER}\n").as_bytes())
            .await
            .context("failed to write to shell")?;
        stdin.flush().await.context("failed to write to shell")?;
        let await_shell = ConnectStep::AwaitShell { destination };
        let _ = progress
            .send(ConnectProgress::Message(await_shell.to_string()))
            .await;

        // Buffered bytes past the marker stay in the reader handed to the client.
        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout
                .read_line(&mut line)
                .await
                .context("failed to read from shell")?;
            if read == 0 {
                let mut detail = String::new();
                let _ = stderr.read_to_string(&mut detail).await;
                let exit = stop_shell(&mut child, &stream.name, SHELL_STOP_GRACE).await;
                debug!(event = "shell.connect.exited", host = %stream.name, exit = %exit);
                anyhow::bail!(describe_connect_failure(&stream.name, &detail, password.is_some()));
            }
            if line.trim_end() == READY_MARKER {
                break;
            }
            debug!(event = "shell.connect.preamble", host = %stream.name, line = %line.trim_end());
        }

        Ok(ShellConnection {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            closer: Box::new(ChildCloser {
                host: stream.name.clone(),
                child,
            }),
        })
    }
}

struct ChildCloser {
    host: String,
    child: Child,
}

#[async_trait]
impl ShellCloser for ChildCloser {
    async fn close(mut self: Box<Self>) {
        let exit = stop_shell(&mut self.child, &self.host, SHELL_STOP_GRACE).await;
        debug!(event = "shell.closed", host = %self.host, exit = %exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShellOptions;

    fn stream(host: &str) -> LogStream {
        LogStream {
            name: host.to_string(),
            host: host.to_string(),
            port: Some(2222),
            user: Some("ops".to_string()),
            jumphost: Some("bastion".to_string()),
            logfile_last: "/var/log/syslog".to_string(),
            logfile_prev: "/var/log/syslog.1".to_string(),
            shell: ShellOptions::default(),
        }
    }

    #[test]
    fn ssh_command_carries_jumphost_port_and_destination() {
        let connector = ProcessConnector {
            ssh_args: vec!["-o".to_string(), "Compression=yes".to_string()],
            ..ProcessConnector::default()
        };
        let cmd = connector.command(&stream("web1"), None).expect("command");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let tail = &args[args.len() - 8..];
        assert_eq!(
            tail,
            ["-J", "bastion", "-p", "2222", "-o", "Compression=yes", "ops@web1", "/bin/sh"]
        );
    }

    #[test]
    fn configured_password_goes_through_askpass() {
        let dir = std::env::temp_dir().join(format!("logfleet-connector-{}", std::process::id()));
        let connector = ProcessConnector {
            ssh_password: Some("s3cret".to_string()),
            askpass_dir: Some(dir.clone()),
            ..ProcessConnector::default()
        };
        let cmd = connector
            .command(&stream("web1"), Some("s3cret"))
            .expect("command");
        let env: Vec<(String, String)> = cmd
            .as_std()
            .get_envs()
            .filter_map(|(key, value)| {
                Some((key.to_string_lossy().to_string(), value?.to_string_lossy().to_string()))
            })
            .collect();
        assert!(env.contains(&("LOGFLEET_SSH_PASS".to_string(), "s3cret".to_string())));
        let askpass = dir.join("ssh-askpass.sh").to_string_lossy().to_string();
        assert!(env.contains(&("SSH_ASKPASS".to_string(), askpass)));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn local_shell_connects_after_ready_marker() {
        let mut local = stream("localhost");
        local.user = None;
        local.port = None;
        local.jumphost = None;
        let (progress, mut progress_rx) = mpsc::channel(8);
        let mut conn = ProcessConnector::default()
            .connect(&local, progress)
            .await
            .expect("local shell");
        assert!(matches!(
            progress_rx.recv().await,
            Some(ConnectProgress::Message(message)) if message == "starting local shell"
        ));
        assert!(matches!(
            progress_rx.recv().await,
            Some(ConnectProgress::Message(message)) if message == "waiting for local shell"
        ));
        conn.stdin.write_all(b"echo hi\n").await.expect("write");
        let mut reader = BufReader::new(conn.stdout);
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read");
        assert_eq!(line, "hi\n");
        conn.closer.close().await;
    }
}
