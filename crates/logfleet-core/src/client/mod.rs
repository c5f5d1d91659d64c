//! Per-host connection client: one actor task per log stream.

mod context;
mod script;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use protocol::agent::QueryArgs;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, info_span, Instrument};

use crate::model::{
    BootstrapIssue, BusyStage, ConnDetails, ConnectionState, LogStream, PerHostQueryResult,
};
use crate::shell::ShellConnector;
use crate::timefmt::{self, TimeFormat, AGENT_MINUTE_FORMAT, AGENT_SECOND_FORMAT};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Idle time without any output before a ping checks the connection.
    pub idle_ping_after: Duration,
    pub tick_interval: Duration,
    /// How long to wait for both output streams to close after a disconnect.
    pub disconnect_timeout: Duration,
    pub agent_script: String,
    pub agent_dir: String,
    pub compress_output: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_delay: Duration::from_secs(30),
            idle_ping_after: Duration::from_secs(40),
            tick_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
            agent_script: String::new(),
            agent_dir: "/tmp".to_string(),
            compress_output: true,
        }
    }
}

/// Where a "load earlier" page resumes: strictly before the oldest message already shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursor {
    pub combined_line: u64,
    pub time: DateTime<Utc>,
    /// Messages already shown that share `time`.
    pub same_time_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogsArgs {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub query: String,
    pub max_lines: usize,
    pub resume_before: Option<ResumeCursor>,
    pub refresh_index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Bootstrap,
    Ping,
    QueryLogs(QueryLogsArgs),
}

#[derive(Debug, Clone)]
pub struct ReplyMailbox {
    pub tx: mpsc::Sender<CommandReply>,
    pub tag: u64,
}

#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    pub reply: Option<ReplyMailbox>,
}

#[derive(Debug, Clone)]
pub struct CommandReply {
    pub host: String,
    pub tag: u64,
    pub result: PerHostQueryResult,
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum ClientUpdateKind {
    State {
        old: ConnectionState,
        new: ConnectionState,
    },
    ConnDetails(ConnDetails),
    /// `None` once the client is no longer busy.
    BusyStage(Option<BusyStage>),
    BootstrapIssue(BootstrapIssue),
    DataRequest {
        title: String,
        reply: oneshot::Sender<String>,
    },
    TornDown,
}

#[derive(Debug)]
pub struct ClientUpdate {
    pub client_id: u64,
    /// Current name of the client; changes once when it is closed.
    pub name: String,
    pub kind: ClientUpdateKind,
}

#[derive(Debug)]
pub struct ClientHandle {
    id: u64,
    name: String,
    stream: LogStream,
    cmd_tx: mpsc::Sender<Command>,
    reconnect_tx: mpsc::Sender<()>,
    disconnect_tx: mpsc::Sender<()>,
    close_tx: Option<oneshot::Sender<String>>,
}

impl ClientHandle {
    pub fn spawn(
        stream: LogStream,
        connector: Arc<dyn ShellConnector>,
        settings: Arc<ClientSettings>,
        updates: mpsc::Sender<ClientUpdate>,
    ) -> Self {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        // Single slot: a pending request already covers any duplicate.
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = oneshot::channel();
        info!(event = "client.spawned", host = %stream.name, client_id = id);
        let worker = worker::Worker::new(id, stream.clone(), connector, settings, updates);
        // Every event of the actor carries the host, which `--debug-host` filters on.
        let span = info_span!("host", host = %stream.name);
        tokio::spawn(
            worker
                .run(worker::Inbox {
                    commands: cmd_rx,
                    reconnect: reconnect_rx,
                    disconnect: disconnect_rx,
                    close: close_rx,
                })
                .instrument(span),
        );
        Self {
            id,
            name: stream.name.clone(),
            stream,
            cmd_tx,
            reconnect_tx,
            disconnect_tx,
            close_tx: Some(close_tx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &LogStream {
        &self.stream
    }

    /// Queues a command; waits while the command mailbox is full.
    pub async fn enqueue(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("client {} has stopped", self.name))
    }

    pub fn reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    pub fn disconnect(&self) {
        let _ = self.disconnect_tx.try_send(());
    }

    /// Starts teardown under `new_name`; a `TornDown` update follows exactly once.
    pub fn close(&mut self, new_name: String) {
        if let Some(close_tx) = self.close_tx.take() {
            self.name = new_name.clone();
            let _ = close_tx.send(new_name);
        }
    }
}

pub(crate) fn index_file(agent_dir: &str, stream: &LogStream) -> String {
    let key = format!("{}\n{}", stream.logfile_last, stream.logfile_prev);
    format!(
        "{}/logfleet_index_{:x}",
        agent_dir.trim_end_matches('/'),
        md5::compute(key.as_bytes())
    )
}

pub(crate) fn build_query_args(
    stream: &LogStream,
    settings: &ClientSettings,
    args: &QueryLogsArgs,
    timezone: Tz,
    time_format: &TimeFormat,
    now: DateTime<Utc>,
) -> QueryArgs {
    let local = |time: DateTime<Utc>| timefmt::format_host_local(time, timezone, AGENT_MINUTE_FORMAT);
    let resume = args.resume_before.as_ref();
    let years_by_month = if time_format.has_year() {
        Vec::new()
    } else {
        timefmt::years_by_month(&now.with_timezone(&timezone))
    };
    QueryArgs {
        logfile_last: stream.logfile_last.clone(),
        logfile_prev: stream.logfile_prev.clone(),
        index_file: index_file(&settings.agent_dir, stream),
        max_lines: args.max_lines,
        from: args.from.map(local),
        to: args.to.map(local),
        lines_until: resume.map(|resume| resume.combined_line),
        timestamp_until_seconds: resume.map(|resume| {
            timefmt::format_host_local(resume.time, timezone, AGENT_SECOND_FORMAT)
        }),
        timestamp_until_precise: resume
            .map(|resume| resume.time.to_rfc3339_opts(SecondsFormat::Micros, true)),
        skip_n_latest: resume.map_or(0, |resume| resume.same_time_count),
        refresh_index: args.refresh_index,
        gzip: settings.compress_output,
        years_by_month,
        rules: time_format.rules.clone(),
        filter: args.query.clone(),
    }
}
