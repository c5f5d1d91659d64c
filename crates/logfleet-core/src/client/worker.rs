use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use chrono_tz::Tz;
use futures_util::StreamExt;
use protocol::framing::MAX_LINE_LENGTH;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, info, warn};

use super::context::{BootstrapOutcome, CommandContext, Finished, LineOutcome, OutStream, Progress};
use super::script;
use super::{
    build_query_args, ClientSettings, ClientUpdate, ClientUpdateKind, Command, CommandKind,
    CommandReply,
};
use crate::model::{BootstrapIssue, BusyStage, ConnDetails, ConnectionState, LogStream, PerHostQueryResult};
use crate::shell::{BoxedWriter, ConnectProgress, ShellConnection, ShellConnector};
use crate::timefmt::TimeFormat;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WRITE_CHANNEL_CAPACITY: usize = 16;
const PROGRESS_CHANNEL_CAPACITY: usize = 16;

pub(super) struct Inbox {
    pub commands: mpsc::Receiver<Command>,
    pub reconnect: mpsc::Receiver<()>,
    pub disconnect: mpsc::Receiver<()>,
    pub close: oneshot::Receiver<String>,
}

/// Everything the background connection tasks report; `seq` identifies the connection attempt.
enum Event {
    Connected {
        seq: u64,
        result: anyhow::Result<ShellConnection>,
    },
    Progress {
        seq: u64,
        progress: ConnectProgress,
    },
    Line {
        seq: u64,
        stream: OutStream,
        line: Bytes,
    },
    Eof {
        seq: u64,
        stream: OutStream,
        error: Option<String>,
    },
    WriteFailed {
        seq: u64,
        error: String,
    },
}

struct LiveConnection {
    writer: Option<mpsc::Sender<String>>,
    /// Fires the shell's closer; dropping it does the same.
    close_signal: Option<oneshot::Sender<()>>,
    open_readers: u8,
}

struct Running {
    command: Command,
    context: CommandContext,
}

pub(super) struct Worker {
    id: u64,
    name: String,
    stream: LogStream,
    connector: Arc<dyn ShellConnector>,
    settings: Arc<ClientSettings>,
    agent_path: String,
    updates: mpsc::Sender<ClientUpdate>,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
    state: ConnectionState,
    attempt: u64,
    seq: u64,
    conn: Option<LiveConnection>,
    queue: VecDeque<Command>,
    current: Option<Running>,
    next_idx: u64,
    timezone: Tz,
    time_format: Option<Arc<TimeFormat>>,
    details: ConnDetails,
    busy_stage: BusyStage,
    last_output: Instant,
    reconnect_at: Option<Instant>,
    reconnect_delay: Duration,
    reconnect_now: bool,
    disconnect_deadline: Option<Instant>,
    hold_disconnected: bool,
    tearing_down: bool,
    torn_down: bool,
}

impl Worker {
    pub(super) fn new(
        id: u64,
        stream: LogStream,
        connector: Arc<dyn ShellConnector>,
        settings: Arc<ClientSettings>,
        updates: mpsc::Sender<ClientUpdate>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let agent_path = script::agent_path(&settings.agent_dir, &settings.agent_script);
        let reconnect_delay = settings.reconnect_delay;
        Self {
            id,
            name: stream.name.clone(),
            stream,
            connector,
            settings,
            agent_path,
            updates,
            events_tx,
            events_rx: Some(events_rx),
            state: ConnectionState::Disconnected,
            attempt: 0,
            seq: 0,
            conn: None,
            queue: VecDeque::new(),
            current: None,
            next_idx: 1,
            timezone: Tz::UTC,
            time_format: None,
            details: ConnDetails::default(),
            busy_stage: BusyStage::default(),
            last_output: Instant::now(),
            reconnect_at: None,
            reconnect_delay,
            reconnect_now: false,
            disconnect_deadline: None,
            hold_disconnected: false,
            tearing_down: false,
            torn_down: false,
        }
    }

    pub(super) async fn run(mut self, mut inbox: Inbox) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut close_pending = true;
        self.start_connecting().await;
        while !self.torn_down {
            tokio::select! {
                Some(command) = inbox.commands.recv() => self.enqueue(command).await,
                Some(()) = inbox.reconnect.recv() => self.reconnect().await,
                Some(()) = inbox.disconnect.recv() => self.disconnect().await,
                result = &mut inbox.close, if close_pending => {
                    close_pending = false;
                    // A dropped handle closes the client under its current name.
                    let new_name = result.unwrap_or_else(|_| self.name.clone());
                    self.close(new_name).await;
                }
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                _ = tick.tick() => self.on_tick().await,
            }
        }
        inbox.commands.close();
        while let Ok(command) = inbox.commands.try_recv() {
            self.reply(command, PerHostQueryResult::default(), Some("client closed".to_string()))
                .await;
        }
        debug!(event = "client.stopped", host = %self.name, client_id = self.id);
    }

    async fn notify(&self, kind: ClientUpdateKind) {
        let update = ClientUpdate {
            client_id: self.id,
            name: self.name.clone(),
            kind,
        };
        if self.updates.send(update).await.is_err() {
            debug!(event = "client.update.dropped", host = %self.name);
        }
    }

    async fn set_state(&mut self, new: ConnectionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        info!(event = "client.state", host = %self.name, from = ?old, to = ?new);
        if old == ConnectionState::ConnectedBusy {
            self.busy_stage = BusyStage::default();
            self.notify(ClientUpdateKind::BusyStage(None)).await;
        }
        self.notify(ClientUpdateKind::State { old, new }).await;
    }

    async fn reply(&self, command: Command, result: PerHostQueryResult, error: Option<String>) {
        let Some(mailbox) = command.reply else {
            return;
        };
        let reply = CommandReply {
            host: self.name.clone(),
            tag: mailbox.tag,
            result,
            error,
        };
        if mailbox.tx.send(reply).await.is_err() {
            debug!(event = "client.reply.dropped", host = %self.name);
        }
    }

    async fn fail_pending(&mut self, reason: &str) {
        let mut pending: Vec<Command> = self.current.take().map(|running| running.command).into_iter().collect();
        pending.extend(self.queue.drain(..));
        for command in pending {
            self.reply(command, PerHostQueryResult::default(), Some(reason.to_string()))
                .await;
        }
    }

    async fn start_connecting(&mut self) {
        if self.state != ConnectionState::Disconnected || self.tearing_down {
            return;
        }
        self.fail_pending("connection reset").await;
        self.attempt += 1;
        self.seq += 1;
        self.reconnect_at = None;
        self.reconnect_now = false;
        self.details = ConnDetails {
            attempt: self.attempt,
            ..ConnDetails::default()
        };
        self.notify(ClientUpdateKind::ConnDetails(self.details.clone())).await;
        self.set_state(ConnectionState::Connecting).await;

        let seq = self.seq;
        let events = self.events_tx.clone();
        let connector = Arc::clone(&self.connector);
        let stream = self.stream.clone();
        let timeout = self.settings.connect_timeout;
        tokio::spawn(async move {
            let (progress_tx, mut progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
            let connect = tokio::time::timeout(timeout, connector.connect(&stream, progress_tx));
            tokio::pin!(connect);
            // Progress is forwarded from this task so it always precedes the result.
            let result = loop {
                tokio::select! {
                    biased;
                    Some(progress) = progress_rx.recv() => {
                        let _ = events.send(Event::Progress { seq, progress }).await;
                    }
                    result = &mut connect => break result,
                }
            };
            while let Ok(progress) = progress_rx.try_recv() {
                let _ = events.send(Event::Progress { seq, progress }).await;
            }
            let result = result.unwrap_or_else(|_| {
                Err(anyhow::anyhow!("connect timed out after {}s", timeout.as_secs()))
            });
            if let Err(mpsc::error::SendError(Event::Connected { result: Ok(conn), .. })) =
                events.send(Event::Connected { seq, result }).await
            {
                conn.closer.close().await;
            }
        });
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { seq, result } => self.on_connected(seq, result).await,
            Event::Progress { seq, progress } if seq == self.seq => match progress {
                ConnectProgress::Message(message) => {
                    self.details.messages.push(message);
                    self.notify(ClientUpdateKind::ConnDetails(self.details.clone())).await;
                }
                ConnectProgress::NeedData { title, reply } => {
                    self.notify(ClientUpdateKind::DataRequest { title, reply }).await;
                }
            },
            Event::Progress { .. } => {}
            Event::Line { seq, stream, line } if seq == self.seq => self.on_line(stream, &line).await,
            Event::Eof { seq, stream, error } if seq == self.seq => {
                self.on_eof(stream, error).await
            }
            Event::WriteFailed { seq, error } if seq == self.seq => {
                warn!(event = "client.write.failed", host = %self.name, error = %error);
                self.begin_disconnect(&format!("write failed: {error}")).await;
            }
            Event::Line { .. } | Event::Eof { .. } | Event::WriteFailed { .. } => {}
        }
    }

    async fn on_connected(&mut self, seq: u64, result: anyhow::Result<ShellConnection>) {
        if seq != self.seq || self.state != ConnectionState::Connecting {
            if let Ok(conn) = result {
                tokio::spawn(conn.closer.close());
            }
            return;
        }
        let conn = match result {
            Ok(conn) => conn,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(event = "client.connect.failed", host = %self.name, attempt = self.attempt, error = %error);
                self.details.err = Some(error);
                self.notify(ClientUpdateKind::ConnDetails(self.details.clone())).await;
                self.set_state(ConnectionState::Disconnected).await;
                self.after_disconnected().await;
                return;
            }
        };
        info!(event = "client.connected", host = %self.name, attempt = self.attempt);
        let ShellConnection {
            stdin,
            stdout,
            stderr,
            closer,
        } = conn;
        spawn_reader(stdout, OutStream::Stdout, seq, self.events_tx.clone());
        spawn_reader(stderr, OutStream::Stderr, seq, self.events_tx.clone());
        let writer = spawn_writer(stdin, seq, self.events_tx.clone());
        let (close_signal, closed) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = closed.await;
            closer.close().await;
        });
        self.conn = Some(LiveConnection {
            writer: Some(writer),
            close_signal: Some(close_signal),
            open_readers: 2,
        });
        self.last_output = Instant::now();
        self.set_state(ConnectionState::ConnectedBusy).await;
        self.start_command(Command {
            kind: CommandKind::Bootstrap,
            reply: None,
        })
        .await;
    }

    async fn enqueue(&mut self, command: Command) {
        match self.state {
            ConnectionState::ConnectedIdle => self.start_command(command).await,
            ConnectionState::ConnectedBusy => self.queue.push_back(command),
            _ => {
                self.reply(command, PerHostQueryResult::default(), Some("host is not connected".to_string()))
                    .await
            }
        }
    }

    async fn start_command(&mut self, command: Command) {
        let idx = self.next_idx;
        self.next_idx += 1;
        let prepared = match &command.kind {
            CommandKind::Bootstrap => Some((
                CommandContext::bootstrap(idx),
                script::bootstrap_body(
                    &self.stream,
                    &self.settings.agent_dir,
                    &self.settings.agent_script,
                ),
            )),
            CommandKind::Ping => Some((CommandContext::ping(idx), script::PING_BODY.to_string())),
            CommandKind::QueryLogs(args) => self.time_format.clone().map(|time_format| {
                let now = Utc::now();
                let query = build_query_args(
                    &self.stream,
                    &self.settings,
                    args,
                    self.timezone,
                    &time_format,
                    now,
                );
                (
                    CommandContext::query(idx, &self.name, self.timezone, time_format, now),
                    script::query_body(&self.stream, &self.agent_path, &query),
                )
            }),
        };
        let Some((context, body)) = prepared else {
            let error = "host is not bootstrapped".to_string();
            self.reply(command, PerHostQueryResult::default(), Some(error))
                .await;
            return;
        };
        let Some(writer) = self.conn.as_ref().and_then(|conn| conn.writer.clone()) else {
            let error = "host is not connected".to_string();
            self.reply(command, PerHostQueryResult::default(), Some(error))
                .await;
            return;
        };
        debug!(event = "client.command.start", host = %self.name, idx, kind = ?command.kind);
        self.current = Some(Running { command, context });
        self.set_state(ConnectionState::ConnectedBusy).await;
        if writer.send(script::render_command(idx, &body)).await.is_err() {
            self.begin_disconnect("shell input closed").await;
        }
    }

    async fn on_line(&mut self, stream: OutStream, line: &[u8]) {
        self.last_output = Instant::now();
        let Some(running) = self.current.as_mut() else {
            debug!(
                event = "client.output.unexpected",
                host = %self.name,
                stream = ?stream,
                line = %String::from_utf8_lossy(line)
            );
            return;
        };
        match running.context.handle_line(stream, line) {
            LineOutcome::Pending => {}
            LineOutcome::Progress(progress) => {
                match progress {
                    Progress::Stage { num, title, extra } => {
                        self.busy_stage = BusyStage {
                            num,
                            title,
                            extra,
                            percentage: 0,
                        };
                    }
                    Progress::Percentage(percentage) => self.busy_stage.percentage = percentage,
                }
                self.notify(ClientUpdateKind::BusyStage(Some(self.busy_stage.clone()))).await;
            }
            LineOutcome::Finished => self.finish_current().await,
        }
    }

    async fn finish_current(&mut self) {
        let Some(Running { command, context }) = self.current.take() else {
            return;
        };
        match context.finish() {
            Finished::Bootstrap(Ok(outcome)) => {
                self.on_bootstrapped(outcome).await;
                self.reply(command, PerHostQueryResult::default(), None).await;
                self.go_idle().await;
            }
            Finished::Bootstrap(Err(failure)) => {
                warn!(event = "client.bootstrap.failed", host = %self.name, error = %failure.err);
                self.notify(ClientUpdateKind::BootstrapIssue(BootstrapIssue {
                    err: Some(failure.err.clone()),
                    warn_no_admin_access: failure.warn_no_admin_access,
                }))
                .await;
                self.details.err = Some(failure.err.clone());
                self.reply(command, PerHostQueryResult::default(), Some(failure.err.clone()))
                    .await;
                self.begin_disconnect(&format!("bootstrap failed: {}", failure.err))
                    .await;
            }
            Finished::Ping { diagnostics } => {
                if let Some(diagnostics) = diagnostics.as_deref() {
                    debug!(event = "client.ping.output", host = %self.name, output = %diagnostics);
                }
                self.reply(command, PerHostQueryResult::default(), None).await;
                self.go_idle().await;
            }
            Finished::Query { result, error } => {
                info!(
                    event = "client.query.done",
                    host = %self.name,
                    messages = result.messages.len(),
                    error = ?error
                );
                self.reply(command, result, error).await;
                self.go_idle().await;
            }
        }
    }

    async fn on_bootstrapped(&mut self, outcome: BootstrapOutcome) {
        if let Some(zone) = outcome.unknown_timezone.as_deref() {
            warn!(event = "client.timezone.unknown", host = %self.name, zone = %zone, "falling back to UTC");
        }
        info!(
            event = "client.bootstrapped",
            host = %self.name,
            layout = outcome.time_format.layout,
            timezone = %outcome.timezone
        );
        self.timezone = outcome.timezone;
        self.time_format = Some(Arc::new(outcome.time_format));
        self.reconnect_delay = self.settings.reconnect_delay;
        self.details = ConnDetails::default();
        self.notify(ClientUpdateKind::ConnDetails(ConnDetails::default())).await;
        if outcome.warn_no_admin_access {
            self.notify(ClientUpdateKind::BootstrapIssue(BootstrapIssue {
                err: None,
                warn_no_admin_access: true,
            }))
            .await;
        }
    }

    async fn go_idle(&mut self) {
        if let Some(next) = self.queue.pop_front() {
            self.start_command(next).await;
            return;
        }
        self.set_state(ConnectionState::ConnectedIdle).await;
    }

    async fn on_eof(&mut self, stream: OutStream, error: Option<String>) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.open_readers = conn.open_readers.saturating_sub(1);
        let open_readers = conn.open_readers;
        if let Some(error) = error.as_deref() {
            warn!(event = "client.read.failed", host = %self.name, stream = ?stream, error = %error);
        }
        match self.state {
            ConnectionState::ConnectedIdle | ConnectionState::ConnectedBusy => {
                self.begin_disconnect("connection closed by remote").await;
            }
            ConnectionState::Disconnecting if open_readers == 0 => self.finish_disconnect().await,
            _ => {}
        }
    }

    /// Leaves a connected state: fails pending commands and closes the shell.
    async fn begin_disconnect(&mut self, reason: &str) {
        match self.state {
            ConnectionState::ConnectedIdle | ConnectionState::ConnectedBusy => {}
            ConnectionState::Connecting => {
                // The attempt in flight is closed when its result arrives.
                self.seq += 1;
                self.set_state(ConnectionState::Disconnected).await;
                self.after_disconnected().await;
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
        }
        info!(event = "client.disconnect", host = %self.name, reason = %reason);
        self.fail_pending(&format!("connection lost: {reason}")).await;
        self.set_state(ConnectionState::Disconnecting).await;
        self.disconnect_deadline = Some(Instant::now() + self.settings.disconnect_timeout);
        let Some(conn) = self.conn.as_mut() else {
            self.finish_disconnect().await;
            return;
        };
        // Dropping the writer ends the writer task, which shuts stdin.
        conn.writer = None;
        if let Some(close_signal) = conn.close_signal.take() {
            let _ = close_signal.send(());
        }
        if conn.open_readers == 0 {
            self.finish_disconnect().await;
        }
    }

    async fn finish_disconnect(&mut self) {
        self.conn = None;
        self.disconnect_deadline = None;
        // Readers of this connection may still report; they are ignored from here on.
        self.seq += 1;
        self.set_state(ConnectionState::Disconnected).await;
        self.after_disconnected().await;
    }

    async fn after_disconnected(&mut self) {
        if self.tearing_down {
            if !self.torn_down {
                self.torn_down = true;
                info!(event = "client.torn_down", host = %self.name, client_id = self.id);
                self.notify(ClientUpdateKind::TornDown).await;
            }
            return;
        }
        if self.hold_disconnected {
            return;
        }
        if self.reconnect_now {
            self.start_connecting().await;
            return;
        }
        let delay = self.reconnect_delay;
        self.reconnect_at = Some(Instant::now() + delay);
        self.reconnect_delay = (delay * 2).min(self.settings.max_reconnect_delay);
        debug!(event = "client.reconnect.scheduled", host = %self.name, delay_ms = delay.as_millis() as u64);
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        match self.state {
            ConnectionState::Disconnected => {
                if self.reconnect_at.is_some_and(|at| at <= now) {
                    self.start_connecting().await;
                }
            }
            ConnectionState::Disconnecting => {
                if self.disconnect_deadline.is_some_and(|at| at <= now) {
                    warn!(event = "client.disconnect.timeout", host = %self.name);
                    self.finish_disconnect().await;
                }
            }
            ConnectionState::ConnectedIdle => {
                if now.duration_since(self.last_output) >= self.settings.idle_ping_after {
                    debug!(event = "client.ping", host = %self.name);
                    self.start_command(Command {
                        kind: CommandKind::Ping,
                        reply: None,
                    })
                    .await;
                }
            }
            ConnectionState::Connecting | ConnectionState::ConnectedBusy => {}
        }
    }

    async fn reconnect(&mut self) {
        if self.tearing_down {
            return;
        }
        self.hold_disconnected = false;
        self.reconnect_delay = self.settings.reconnect_delay;
        match self.state {
            ConnectionState::Disconnected => self.start_connecting().await,
            ConnectionState::Connecting => {}
            ConnectionState::Disconnecting => self.reconnect_now = true,
            ConnectionState::ConnectedIdle | ConnectionState::ConnectedBusy => {
                self.reconnect_now = true;
                self.begin_disconnect("reconnect requested").await;
            }
        }
    }

    async fn disconnect(&mut self) {
        self.hold_disconnected = true;
        self.reconnect_now = false;
        self.reconnect_at = None;
        self.begin_disconnect("disconnect requested").await;
    }

    async fn close(&mut self, new_name: String) {
        if new_name != self.name {
            info!(event = "client.renamed", host = %self.name, new_name = %new_name);
            self.name = new_name;
        }
        self.tearing_down = true;
        self.reconnect_at = None;
        match self.state {
            ConnectionState::Disconnected => self.after_disconnected().await,
            ConnectionState::Disconnecting => {}
            _ => self.begin_disconnect("closing").await,
        }
    }
}

fn spawn_reader<R>(reader: R, stream: OutStream, seq: u64, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let codec = AnyDelimiterCodec::new_with_max_length(vec![b'\n'], Vec::new(), MAX_LINE_LENGTH);
        let mut lines = FramedRead::new(reader, codec);
        let error = loop {
            match lines.next().await {
                Some(Ok(line)) => {
                    if events.send(Event::Line { seq, stream, line }).await.is_err() {
                        return;
                    }
                }
                Some(Err(err)) => break Some(err.to_string()),
                None => break None,
            }
        };
        let _ = events.send(Event::Eof { seq, stream, error }).await;
    });
}

fn spawn_writer(mut stdin: BoxedWriter, seq: u64, events: mpsc::Sender<Event>) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(WRITE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let written = async {
                stdin.write_all(chunk.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(err) = written {
                let _ = events
                    .send(Event::WriteFailed {
                        seq,
                        error: err.to_string(),
                    })
                    .await;
                return;
            }
        }
        let _ = stdin.shutdown().await;
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::super::{ClientHandle, QueryLogsArgs, ReplyMailbox};
    use super::*;
    use crate::shell::fake::{test_stream, FakeConnector, FakeHost, GzipOutput};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_settings() -> Arc<ClientSettings> {
        Arc::new(ClientSettings {
            connect_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(50),
            max_reconnect_delay: Duration::from_millis(200),
            idle_ping_after: Duration::from_secs(60),
            tick_interval: Duration::from_millis(10),
            disconnect_timeout: Duration::from_millis(500),
            agent_script: "#!/bin/bash\necho agent\n".to_string(),
            agent_dir: "/tmp".to_string(),
            compress_output: true,
        })
    }

    fn query() -> Command {
        Command {
            kind: CommandKind::QueryLogs(QueryLogsArgs {
                from: None,
                to: None,
                query: String::new(),
                max_lines: 100,
                resume_before: None,
                refresh_index: false,
            }),
            reply: None,
        }
    }

    async fn wait_for(
        updates: &mut mpsc::Receiver<ClientUpdate>,
        mut matches: impl FnMut(&ClientUpdateKind) -> bool,
    ) -> ClientUpdate {
        tokio::time::timeout(WAIT, async {
            loop {
                let update = updates.recv().await.expect("client updates open");
                if matches(&update.kind) {
                    return update;
                }
            }
        })
        .await
        .expect("update in time")
    }

    async fn wait_for_state(updates: &mut mpsc::Receiver<ClientUpdate>, state: ConnectionState) {
        wait_for(updates, |kind| {
            matches!(kind, ClientUpdateKind::State { new, .. } if *new == state)
        })
        .await;
    }

    fn spawn(
        connector: &Arc<FakeConnector>,
        settings: Arc<ClientSettings>,
    ) -> (ClientHandle, mpsc::Receiver<ClientUpdate>) {
        let (updates_tx, updates) = mpsc::channel(512);
        let connector: Arc<dyn ShellConnector> = connector.clone();
        let handle = ClientHandle::spawn(test_stream("web1"), connector, settings, updates_tx);
        (handle, updates)
    }

    #[tokio::test]
    async fn bootstraps_then_answers_queries() {
        let connector = Arc::new(FakeConnector::default());
        connector.insert(
            "web1",
            FakeHost::syslog(vec![
                "logfile:/var/log/syslog:0".to_string(),
                "s:Mar  5 10:00,2".to_string(),
                "m:3:Mar  5 10:00:01 web1 sshd[12]: accepted key".to_string(),
                "m:4:Mar  5 10:00:02 web1 cron: error running job".to_string(),
            ]),
        );
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        let (reply_tx, mut replies) = mpsc::channel(4);
        let mut command = query();
        command.reply = Some(ReplyMailbox { tx: reply_tx, tag: 9 });
        handle.enqueue(command).await.expect("enqueue");
        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.tag, 9);
        assert_eq!(reply.host, "web1");
        assert_eq!(reply.error, None);
        assert_eq!(reply.result.histogram.values().sum::<u64>(), 2);
        assert_eq!(reply.result.messages.len(), 2);
        assert_eq!(reply.result.messages[0].msg, "accepted key");
        assert_eq!(reply.result.messages[1].context["level"], "error");
        assert_eq!(reply.result.messages[1].log_filename, "/var/log/syslog");

        let invocations = connector.queries("web1");
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].contains("--gzip"));
        assert!(invocations[0].contains("--years-by-month"));
    }

    #[tokio::test]
    async fn gzip_framed_answers_are_decoded() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(vec![
            "m:1:Mar  5 10:00:01 web1 app: one".to_string(),
            "m:2:Mar  5 10:00:02 web1 app: two".to_string(),
        ]);
        fake.gzip = GzipOutput::Framed;
        connector.insert("web1", fake);
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        let (reply_tx, mut replies) = mpsc::channel(4);
        let mut command = query();
        command.reply = Some(ReplyMailbox { tx: reply_tx, tag: 1 });
        handle.enqueue(command).await.expect("enqueue");
        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.error, None);
        let texts: Vec<&str> = reply.result.messages.iter().map(|m| m.msg.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    async fn query_reply(handle: &ClientHandle, tag: u64) -> CommandReply {
        let (reply_tx, mut replies) = mpsc::channel(4);
        let mut command = query();
        command.reply = Some(ReplyMailbox { tx: reply_tx, tag });
        handle.enqueue(command).await.expect("enqueue");
        tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply")
    }

    #[tokio::test]
    async fn broken_gzip_output_fails_the_query_and_frees_the_client() {
        for (mode, expected) in [
            (GzipOutput::Truncated, "compressed output ended without gzip_end"),
            (GzipOutput::Corrupt, "failed to decompress output"),
        ] {
            let connector = Arc::new(FakeConnector::default());
            let mut fake = FakeHost::syslog(vec!["m:1:Mar  5 10:00:01 web1 app: one".to_string()]);
            fake.gzip = mode;
            connector.insert("web1", fake);
            let (handle, mut updates) = spawn(&connector, fast_settings());
            wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

            let reply = query_reply(&handle, 1).await;
            let error = reply.error.expect("query error");
            assert!(error.starts_with(expected), "{mode:?}: {error}");
            wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

            let again = query_reply(&handle, 2).await;
            assert!(again.error.is_some());
            assert_eq!(again.tag, 2);
        }
    }

    #[tokio::test]
    async fn failing_ping_still_answers_with_success() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(Vec::new());
        fake.ping_exit_code = 1;
        connector.insert("web1", fake);
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        let (reply_tx, mut replies) = mpsc::channel(4);
        handle
            .enqueue(Command {
                kind: CommandKind::Ping,
                reply: Some(ReplyMailbox { tx: reply_tx, tag: 9 }),
            })
            .await
            .expect("enqueue");
        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.error, None);
        assert_eq!(reply.result, PerHostQueryResult::default());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;
    }

    #[tokio::test]
    async fn progress_is_reported_while_busy() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(Vec::new());
        fake.query_delay = Duration::from_millis(200);
        connector.insert("web1", fake);
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        handle.enqueue(query()).await.expect("enqueue");
        let update = wait_for(&mut updates, |kind| {
            matches!(kind, ClientUpdateKind::BusyStage(Some(stage)) if stage.percentage == 100)
        })
        .await;
        let ClientUpdateKind::BusyStage(Some(stage)) = update.kind else {
            panic!("expected a busy stage");
        };
        assert_eq!(stage.num, 1);
        assert_eq!(stage.title, "querying");
        wait_for(&mut updates, |kind| matches!(kind, ClientUpdateKind::BusyStage(None))).await;
    }

    #[tokio::test]
    async fn lost_connection_fails_the_query_and_reconnects() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(Vec::new());
        fake.query_delay = Duration::from_secs(30);
        connector.insert("web1", fake);
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        let (reply_tx, mut replies) = mpsc::channel(4);
        let mut command = query();
        command.reply = Some(ReplyMailbox { tx: reply_tx, tag: 3 });
        handle.enqueue(command).await.expect("enqueue");
        wait_for_state(&mut updates, ConnectionState::ConnectedBusy).await;
        connector.drop_connection("web1");

        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        let error = reply.error.expect("query fails");
        assert!(error.starts_with("connection lost"), "{error}");

        wait_for_state(&mut updates, ConnectionState::Disconnected).await;
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;
        assert_eq!(connector.connect_count("web1"), 2);
    }

    #[tokio::test]
    async fn failed_connects_are_retried_with_details() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(Vec::new());
        fake.fail_connect = Some("connection refused".to_string());
        connector.insert("web1", fake);
        let (handle, mut updates) = spawn(&connector, fast_settings());

        let update = wait_for(&mut updates, |kind| {
            matches!(kind, ClientUpdateKind::ConnDetails(details) if details.err.is_some())
        })
        .await;
        let ClientUpdateKind::ConnDetails(details) = update.kind else {
            panic!("expected connection details");
        };
        assert_eq!(details.attempt, 1);
        assert_eq!(details.err.as_deref(), Some("connection refused"));
        assert_eq!(details.messages, vec!["dialing web1".to_string()]);

        let (reply_tx, mut replies) = mpsc::channel(4);
        handle
            .enqueue(Command {
                kind: CommandKind::Ping,
                reply: Some(ReplyMailbox { tx: reply_tx, tag: 1 }),
            })
            .await
            .expect("enqueue");
        let reply = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert_eq!(reply.error.as_deref(), Some("host is not connected"));

        wait_for(&mut updates, |kind| {
            matches!(kind, ClientUpdateKind::ConnDetails(details) if details.attempt == 2)
        })
        .await;
    }

    #[tokio::test]
    async fn bootstrap_failure_is_reported_and_disconnects() {
        let connector = Arc::new(FakeConnector::default());
        let mut fake = FakeHost::syslog(Vec::new());
        fake.bootstrap_ok = false;
        connector.insert("web1", fake);
        let (_handle, mut updates) = spawn(&connector, fast_settings());

        let update = wait_for(&mut updates, |kind| {
            matches!(kind, ClientUpdateKind::BootstrapIssue(_))
        })
        .await;
        let ClientUpdateKind::BootstrapIssue(issue) = update.kind else {
            panic!("expected a bootstrap issue");
        };
        assert_eq!(issue.err.as_deref(), Some("bootstrap failed"));
        wait_for_state(&mut updates, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn disconnect_holds_until_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        connector.insert("web1", FakeHost::syslog(Vec::new()));
        let (handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        handle.disconnect();
        wait_for_state(&mut updates, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.connect_count("web1"), 1);

        handle.reconnect();
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;
        assert_eq!(connector.connect_count("web1"), 2);
    }

    #[tokio::test]
    async fn idle_clients_ping_the_host() {
        let connector = Arc::new(FakeConnector::default());
        connector.insert("web1", FakeHost::syslog(Vec::new()));
        let mut settings = (*fast_settings()).clone();
        settings.idle_ping_after = Duration::from_millis(50);
        let (_handle, mut updates) = spawn(&connector, Arc::new(settings));
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        let update = wait_for(&mut updates, |kind| matches!(kind, ClientUpdateKind::State { .. })).await;
        assert!(matches!(
            update.kind,
            ClientUpdateKind::State {
                old: ConnectionState::ConnectedIdle,
                new: ConnectionState::ConnectedBusy
            }
        ));
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;
        assert_eq!(connector.connect_count("web1"), 1);
    }

    #[tokio::test]
    async fn close_renames_and_tears_down_once() {
        let connector = Arc::new(FakeConnector::default());
        connector.insert("web1", FakeHost::syslog(Vec::new()));
        let (mut handle, mut updates) = spawn(&connector, fast_settings());
        wait_for_state(&mut updates, ConnectionState::ConnectedIdle).await;

        handle.close("old_1234abcd_web1".to_string());
        assert_eq!(handle.name(), "old_1234abcd_web1");
        let update = wait_for(&mut updates, |kind| matches!(kind, ClientUpdateKind::TornDown)).await;
        assert_eq!(update.name, "old_1234abcd_web1");
        assert_eq!(update.client_id, handle.id());

        let rest = tokio::time::timeout(WAIT, async {
            let mut torn_down = 0;
            while let Some(update) = updates.recv().await {
                if matches!(update.kind, ClientUpdateKind::TornDown) {
                    torn_down += 1;
                }
            }
            torn_down
        })
        .await
        .expect("worker stops");
        assert_eq!(rest, 0);
        assert!(handle.enqueue(query()).await.is_err());
        assert_eq!(connector.connect_count("web1"), 1);
    }
}
