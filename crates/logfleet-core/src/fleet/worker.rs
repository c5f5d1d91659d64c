use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::merge::{self, Retained};
use super::snapshot::{self, HostView};
use super::{FleetUpdate, Request};
use crate::client::{
    ClientHandle, ClientSettings, ClientUpdate, ClientUpdateKind, Command, CommandKind,
    CommandReply, QueryLogsArgs, ReplyMailbox,
};
use crate::error::QueryRejected;
use crate::model::{LogStream, PerHostQueryResult, QueryParams};
use crate::resolve::HostResolver;
use crate::shell::ShellConnector;

const CLIENT_UPDATE_CHANNEL_CAPACITY: usize = 512;
const REPLY_CHANNEL_CAPACITY: usize = 512;

struct ClientEntry {
    handle: ClientHandle,
    view: HostView,
}

struct InFlight {
    tag: u64,
    started: Instant,
    params: QueryParams,
    load_earlier: bool,
    pending: BTreeSet<String>,
    results: BTreeMap<String, PerHostQueryResult>,
    errors: BTreeMap<String, String>,
}

pub(super) struct Worker {
    resolver: Arc<dyn HostResolver>,
    connector: Arc<dyn ShellConnector>,
    settings: Arc<ClientSettings>,
    updates: mpsc::Sender<FleetUpdate>,
    client_updates_tx: mpsc::Sender<ClientUpdate>,
    client_updates_rx: Option<mpsc::Receiver<ClientUpdate>>,
    replies_tx: mpsc::Sender<CommandReply>,
    replies_rx: Option<mpsc::Receiver<CommandReply>>,
    clients: BTreeMap<String, ClientEntry>,
    /// Clients asked to close, keyed by their disambiguated name, until they report `TornDown`.
    closing: HashMap<String, ClientHandle>,
    pending_teardown: HashMap<String, i64>,
    retained: BTreeMap<String, Retained>,
    in_flight: Option<InFlight>,
    last_query: Option<QueryParams>,
    next_tag: u64,
    tearing_down: bool,
    finished: bool,
}

impl Worker {
    pub(super) fn new(
        resolver: Arc<dyn HostResolver>,
        connector: Arc<dyn ShellConnector>,
        settings: Arc<ClientSettings>,
        updates: mpsc::Sender<FleetUpdate>,
    ) -> Self {
        let (client_updates_tx, client_updates_rx) = mpsc::channel(CLIENT_UPDATE_CHANNEL_CAPACITY);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        Self {
            resolver,
            connector,
            settings,
            updates,
            client_updates_tx,
            client_updates_rx: Some(client_updates_rx),
            replies_tx,
            replies_rx: Some(replies_rx),
            clients: BTreeMap::new(),
            closing: HashMap::new(),
            pending_teardown: HashMap::new(),
            retained: BTreeMap::new(),
            in_flight: None,
            last_query: None,
            next_tag: 1,
            tearing_down: false,
            finished: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        shutdown: CancellationToken,
    ) {
        let (Some(mut client_updates), Some(mut replies)) =
            (self.client_updates_rx.take(), self.replies_rx.take())
        else {
            return;
        };
        let mut shutdown_seen = false;
        while !self.finished {
            tokio::select! {
                _ = shutdown.cancelled(), if !shutdown_seen => {
                    shutdown_seen = true;
                    self.begin_teardown().await;
                }
                Some(request) = requests.recv(), if !self.tearing_down => {
                    self.handle_request(request).await;
                }
                Some(update) = client_updates.recv() => self.on_client_update(update).await,
                Some(reply) = replies.recv() => self.on_reply(reply).await,
            }
        }
        info!(event = "fleet.teardown.done");
    }

    async fn emit(&self, update: FleetUpdate) {
        if self.updates.send(update).await.is_err() {
            debug!(event = "fleet.update.dropped");
        }
    }

    async fn emit_snapshot(&self) {
        let snapshot = snapshot::compute(
            self.clients.iter().map(|(name, entry)| (name, &entry.view)),
            self.closing.keys(),
            self.in_flight.is_some(),
        );
        self.emit(FleetUpdate::Snapshot(snapshot)).await;
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::SetHosts { filter, reply } => {
                let result = self.set_hosts(&filter).await;
                let _ = reply.send(result);
            }
            Request::QueryLogs { params, reply } => {
                let result = self.query_logs(params).await;
                let _ = reply.send(result);
            }
            Request::AbortQuery => {
                if let Some(in_flight) = self.in_flight.take() {
                    info!(event = "fleet.query.aborted", tag = in_flight.tag);
                    self.emit_snapshot().await;
                }
            }
            Request::ReconnectAll => {
                for entry in self.clients.values() {
                    entry.handle.reconnect();
                }
            }
            Request::DisconnectAll => {
                for entry in self.clients.values() {
                    entry.handle.disconnect();
                }
            }
        }
    }

    async fn set_hosts(&mut self, filter: &str) -> anyhow::Result<()> {
        let streams = self.resolver.resolve(filter).await?;
        let mut target: BTreeMap<String, LogStream> = BTreeMap::new();
        for stream in streams {
            let name = stream.name.clone();
            if target.insert(name.clone(), stream).is_some() {
                anyhow::bail!("host filter resolves to duplicate stream name {name}");
            }
        }

        let stale: Vec<String> = self
            .clients
            .iter()
            .filter(|(name, entry)| target.get(*name) != Some(entry.handle.stream()))
            .map(|(name, _)| name.clone())
            .collect();
        let added: Vec<LogStream> = target
            .into_values()
            .filter(|stream| {
                stale.contains(&stream.name) || !self.clients.contains_key(&stream.name)
            })
            .collect();
        if stale.is_empty() && added.is_empty() {
            debug!(event = "fleet.hosts.unchanged", filter = %filter);
            self.emit_snapshot().await;
            return Ok(());
        }

        info!(
            event = "fleet.hosts.changed",
            filter = %filter,
            removed = stale.len(),
            added = added.len()
        );
        for name in stale {
            if let Some(entry) = self.clients.remove(&name) {
                self.close_client(entry.handle);
            }
            self.retained.remove(&name);
        }
        for stream in added {
            self.spawn_client(stream);
        }
        if let Some(in_flight) = self.in_flight.take() {
            warn!(event = "fleet.query.discarded", tag = in_flight.tag);
            let mut errors = BTreeMap::new();
            errors.insert(
                "fleet".to_string(),
                "host set changed while query was in flight".to_string(),
            );
            let elapsed = in_flight.started.elapsed();
            self.emit(FleetUpdate::QueryResult(merge::error_result(
                &errors,
                in_flight.load_earlier,
                elapsed,
            )))
            .await;
        }
        self.emit_snapshot().await;
        Ok(())
    }

    fn spawn_client(&mut self, stream: LogStream) {
        let name = stream.name.clone();
        let handle = ClientHandle::spawn(
            stream,
            Arc::clone(&self.connector),
            Arc::clone(&self.settings),
            self.client_updates_tx.clone(),
        );
        self.clients.insert(
            name,
            ClientEntry {
                handle,
                view: HostView::default(),
            },
        );
    }

    /// Renames the client so a new one can take its name, then waits for its `TornDown`.
    fn close_client(&mut self, mut handle: ClientHandle) {
        let suffix = Uuid::new_v4().simple().to_string();
        let new_name = format!("old_{}_{}", &suffix[..8], handle.name());
        debug!(event = "fleet.client.closing", host = %handle.name(), new_name = %new_name);
        handle.close(new_name.clone());
        *self.pending_teardown.entry(new_name.clone()).or_insert(0) += 1;
        self.closing.insert(new_name, handle);
    }

    fn pending_teardowns(&self) -> i64 {
        self.pending_teardown.values().sum()
    }

    async fn begin_teardown(&mut self) {
        info!(event = "fleet.teardown.start", clients = self.clients.len());
        self.tearing_down = true;
        self.in_flight = None;
        let clients = std::mem::take(&mut self.clients);
        for (_, entry) in clients {
            self.close_client(entry.handle);
        }
        self.emit_snapshot().await;
        if self.pending_teardowns() == 0 {
            self.finished = true;
        }
    }

    async fn query_logs(&mut self, params: QueryParams) -> Result<(), QueryRejected> {
        if self.clients.is_empty() {
            return Err(QueryRejected::NoMatchingHosts);
        }
        let not_connected = self
            .clients
            .values()
            .filter(|entry| !entry.view.state.is_connected())
            .count();
        if not_connected > 0 {
            return Err(QueryRejected::NotConnected(not_connected));
        }
        if self.in_flight.is_some() {
            return Err(QueryRejected::Busy);
        }

        let load_earlier = params.load_earlier && self.last_query.is_some();
        let tag = self.next_tag;
        self.next_tag += 1;
        info!(
            event = "fleet.query.start",
            tag,
            hosts = self.clients.len(),
            load_earlier,
            query = %params.query
        );
        self.in_flight = Some(InFlight {
            tag,
            started: Instant::now(),
            params: params.clone(),
            load_earlier,
            pending: self.clients.keys().cloned().collect(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
        });
        self.last_query = Some(params.clone());

        let mut failed = Vec::new();
        for (name, entry) in &self.clients {
            let resume_before = if load_earlier {
                self.retained.get(name).and_then(Retained::resume_cursor)
            } else {
                None
            };
            let command = Command {
                kind: CommandKind::QueryLogs(QueryLogsArgs {
                    from: params.from,
                    to: params.to,
                    query: params.query.clone(),
                    max_lines: params.max_lines,
                    resume_before,
                    refresh_index: params.refresh_index,
                }),
                reply: Some(ReplyMailbox {
                    tx: self.replies_tx.clone(),
                    tag,
                }),
            };
            if let Err(err) = entry.handle.enqueue(command).await {
                failed.push((name.clone(), format!("{err:#}")));
            }
        }
        for (host, error) in failed {
            self.record_reply(CommandReply {
                host,
                tag,
                result: PerHostQueryResult::default(),
                error: Some(error),
            })
            .await;
        }
        self.emit_snapshot().await;
        Ok(())
    }

    async fn on_reply(&mut self, reply: CommandReply) {
        self.record_reply(reply).await;
    }

    async fn record_reply(&mut self, reply: CommandReply) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            debug!(event = "fleet.reply.late", host = %reply.host, tag = reply.tag);
            return;
        };
        if in_flight.tag != reply.tag || !in_flight.pending.remove(&reply.host) {
            debug!(event = "fleet.reply.stale", host = %reply.host, tag = reply.tag);
            return;
        }
        match reply.error {
            Some(error) => {
                warn!(event = "fleet.query.host_failed", host = %reply.host, error = %error);
                in_flight.errors.insert(reply.host, error);
            }
            None => {
                in_flight.results.insert(reply.host, reply.result);
            }
        }
        if in_flight.pending.is_empty() {
            self.finish_query().await;
        }
    }

    async fn finish_query(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        let elapsed = in_flight.started.elapsed();
        let result = if in_flight.errors.is_empty() {
            merge::merge(
                &mut self.retained,
                in_flight.results,
                &in_flight.params,
                in_flight.load_earlier,
                elapsed,
            )
        } else {
            merge::error_result(&in_flight.errors, in_flight.load_earlier, elapsed)
        };
        info!(
            event = "fleet.query.merged",
            tag = in_flight.tag,
            messages = result.messages.len(),
            total = result.num_msgs_total,
            errors = result.errors.len(),
            elapsed_ms = elapsed.as_millis() as u64
        );
        self.emit(FleetUpdate::QueryResult(result)).await;
        self.emit_snapshot().await;
    }

    async fn on_client_update(&mut self, update: ClientUpdate) {
        let ClientUpdate {
            client_id,
            name,
            kind,
        } = update;
        if let ClientUpdateKind::TornDown = kind {
            self.on_torn_down(client_id, &name).await;
            return;
        }
        if let ClientUpdateKind::DataRequest { title, reply } = kind {
            self.emit(FleetUpdate::DataRequest {
                host: name,
                title,
                reply,
            })
            .await;
            return;
        }
        let Some(entry) = self
            .clients
            .get_mut(&name)
            .filter(|entry| entry.handle.id() == client_id)
        else {
            // Closing clients keep reporting until they are gone; only teardown matters.
            return;
        };
        match kind {
            ClientUpdateKind::State { new, .. } => entry.view.state = new,
            ClientUpdateKind::ConnDetails(details) => entry.view.conn_details = details,
            ClientUpdateKind::BusyStage(stage) => entry.view.busy_stage = stage,
            ClientUpdateKind::BootstrapIssue(issue) => {
                self.emit(FleetUpdate::BootstrapIssue { host: name, issue })
                    .await;
                return;
            }
            ClientUpdateKind::DataRequest { .. } | ClientUpdateKind::TornDown => return,
        }
        self.emit_snapshot().await;
    }

    async fn on_torn_down(&mut self, client_id: u64, name: &str) {
        let Some(count) = self.pending_teardown.get_mut(name) else {
            error!(event = "fleet.teardown.unexpected", host = %name, client_id);
            return;
        };
        *count -= 1;
        if *count < 0 {
            error!(event = "fleet.teardown.negative", host = %name, count = *count);
        }
        if *count <= 0 {
            self.pending_teardown.remove(name);
        }
        self.closing.remove(name);
        debug!(event = "fleet.client.torn_down", host = %name, pending = self.pending_teardowns());
        if self.tearing_down && self.pending_teardowns() <= 0 {
            self.finished = true;
            return;
        }
        self.emit_snapshot().await;
    }
}
