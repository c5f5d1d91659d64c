//! In-memory shell that plays the agent's side of the protocol.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ConnectProgress, ShellCloser, ShellConnection, ShellConnector};
use crate::model::{LogStream, ShellOptions};

const PIPE_CAPACITY: usize = 1 << 20;

pub(crate) fn test_stream(name: &str) -> LogStream {
    LogStream {
        name: name.to_string(),
        host: name.to_string(),
        port: None,
        user: None,
        jumphost: None,
        logfile_last: "/var/log/syslog".to_string(),
        logfile_prev: "/var/log/syslog.1".to_string(),
        shell: ShellOptions::default(),
    }
}

/// How the fake agent frames its query output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GzipOutput {
    Plain,
    Framed,
    /// Dies halfway through the payload, before `gzip_end`.
    Truncated,
    /// A complete frame around bytes that are not gzip.
    Corrupt,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeHost {
    pub timezone: String,
    pub examples: Vec<String>,
    pub bootstrap_ok: bool,
    pub query_stdout: Vec<String>,
    pub query_stderr: Vec<String>,
    pub gzip: GzipOutput,
    /// Exit status reported for the idle ping.
    pub ping_exit_code: i32,
    pub query_delay: Duration,
    pub fail_connect: Option<String>,
}

impl FakeHost {
    pub fn syslog(query_stdout: Vec<String>) -> Self {
        Self {
            timezone: "UTC".to_string(),
            examples: vec!["Mar  5 10:00:00 host app: example".to_string()],
            bootstrap_ok: true,
            query_stdout,
            query_stderr: vec!["p:stage:1:querying".to_string(), "p:p:100".to_string()],
            gzip: GzipOutput::Plain,
            ping_exit_code: 0,
            query_delay: Duration::ZERO,
            fail_connect: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    hosts: HashMap<String, FakeHost>,
    connects: HashMap<String, usize>,
    invocations: HashMap<String, Vec<String>>,
    live: HashMap<String, CancellationToken>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    shared: Arc<Mutex<Shared>>,
}

impl FakeConnector {
    pub fn insert(&self, host: &str, fake: FakeHost) {
        self.lock().hosts.insert(host.to_string(), fake);
    }

    pub fn connect_count(&self, host: &str) -> usize {
        self.lock().connects.get(host).copied().unwrap_or(0)
    }

    /// Agent query invocations the host received, as written to its stdin.
    pub fn queries(&self, host: &str) -> Vec<String> {
        self.lock()
            .invocations
            .get(host)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulates the remote end going away.
    pub fn drop_connection(&self, host: &str) {
        if let Some(token) = self.lock().live.remove(host) {
            token.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("fake connector lock")
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(
        &self,
        stream: &LogStream,
        progress: mpsc::Sender<ConnectProgress>,
    ) -> anyhow::Result<ShellConnection> {
        let fake = {
            let mut shared = self.lock();
            *shared.connects.entry(stream.host.clone()).or_default() += 1;
            shared.hosts.get(&stream.host).cloned()
        };
        let fake = fake.ok_or_else(|| anyhow::anyhow!("unknown fake host {}", stream.host))?;
        let _ = progress
            .send(ConnectProgress::Message(format!("dialing {}", stream.host)))
            .await;
        if let Some(err) = fake.fail_connect.clone() {
            anyhow::bail!(err);
        }

        let (client_stdin, remote_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_stdout, client_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_stderr, client_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let token = CancellationToken::new();
        self.lock().live.insert(stream.host.clone(), token.clone());
        tokio::spawn(run_remote(
            stream.host.clone(),
            fake,
            Arc::clone(&self.shared),
            remote_stdin,
            remote_stdout,
            remote_stderr,
            token.clone(),
        ));
        Ok(ShellConnection {
            stdin: Box::new(client_stdin),
            stdout: Box::new(client_stdout),
            stderr: Box::new(client_stderr),
            closer: Box::new(FakeCloser { token }),
        })
    }
}

struct FakeCloser {
    token: CancellationToken,
}

#[async_trait]
impl ShellCloser for FakeCloser {
    async fn close(self: Box<Self>) {
        self.token.cancel();
    }
}

fn gzip(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        encoder.write_all(line.as_bytes()).expect("gzip write");
        encoder.write_all(b"\n").expect("gzip write");
    }
    encoder.finish().expect("gzip finish")
}

async fn emit(out: &mut DuplexStream, lines: &[String]) {
    for line in lines {
        let _ = out.write_all(format!("{line}\n").as_bytes()).await;
    }
}

async fn run_remote(
    host: String,
    fake: FakeHost,
    shared: Arc<Mutex<Shared>>,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stdin).lines();
    let mut in_heredoc = false;
    let mut exit_code = 0;
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        if in_heredoc {
            in_heredoc = line != "LOGFLEET_AGENT_EOF";
            continue;
        }
        if line.contains("<<'LOGFLEET_AGENT_EOF'") {
            in_heredoc = true;
            continue;
        }
        if let Some(rest) = line.strip_prefix("echo command_done:") {
            let idx = rest.split(';').next().unwrap_or_default();
            let marker = vec![format!("command_done:{idx}")];
            emit(&mut stdout, &marker).await;
            emit(&mut stderr, &marker).await;
        } else if line.starts_with("echo reset_output") {
            let marker = vec!["reset_output".to_string()];
            emit(&mut stdout, &marker).await;
            emit(&mut stderr, &marker).await;
        } else if line.starts_with("echo \"exit_code:") {
            emit(&mut stdout, &[format!("exit_code:{exit_code}")]).await;
            exit_code = 0;
        } else if line == "true" {
            emit(&mut stderr, &["ping: remote says hello".to_string()]).await;
            exit_code = fake.ping_exit_code;
        } else if line.contains(" logstream_info ") {
            let mut out = vec![format!("host_timezone:{}", fake.timezone)];
            out.extend(
                fake.examples
                    .iter()
                    .map(|example| format!("example_log_line:{example}")),
            );
            out.push(if fake.bootstrap_ok {
                "bootstrap ok".to_string()
            } else {
                "bootstrap failed".to_string()
            });
            emit(&mut stdout, &out).await;
        } else if line.contains(" query ") {
            shared
                .lock()
                .expect("fake connector lock")
                .invocations
                .entry(host.clone())
                .or_default()
                .push(line.clone());
            emit(&mut stderr, &fake.query_stderr).await;
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(fake.query_delay) => {}
            }
            let mut payload = b"gzip_start\n".to_vec();
            match fake.gzip {
                GzipOutput::Plain => {
                    emit(&mut stdout, &fake.query_stdout).await;
                    continue;
                }
                GzipOutput::Framed => {
                    payload.extend(gzip(&fake.query_stdout));
                    payload.extend_from_slice(b"gzip_end\n");
                }
                GzipOutput::Truncated => {
                    let compressed = gzip(&fake.query_stdout);
                    payload.extend_from_slice(&compressed[..compressed.len() / 2]);
                    payload.push(b'\n');
                    exit_code = 141;
                }
                GzipOutput::Corrupt => payload.extend_from_slice(b"not gzip at all\ngzip_end\n"),
            }
            let _ = stdout.write_all(&payload).await;
        }
    }
}
