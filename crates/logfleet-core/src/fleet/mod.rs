//! Fleet coordinator: owns one client per resolved log stream and runs fleet-wide queries.

mod merge;
mod snapshot;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::ClientSettings;
use crate::error::QueryRejected;
use crate::model::{BootstrapIssue, FleetSnapshot, MergedQueryResult, QueryParams};
use crate::resolve::HostResolver;
use crate::shell::ShellConnector;

const REQUEST_CHANNEL_CAPACITY: usize = 32;
const UPDATE_CHANNEL_CAPACITY: usize = 512;

#[derive(Debug)]
pub enum FleetUpdate {
    Snapshot(FleetSnapshot),
    QueryResult(MergedQueryResult),
    BootstrapIssue {
        host: String,
        issue: BootstrapIssue,
    },
    /// A connector needs interactive input, such as a password.
    DataRequest {
        host: String,
        title: String,
        reply: oneshot::Sender<String>,
    },
}

#[derive(Debug)]
enum Request {
    SetHosts {
        filter: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    QueryLogs {
        params: QueryParams,
        reply: oneshot::Sender<Result<(), QueryRejected>>,
    },
    AbortQuery,
    ReconnectAll,
    DisconnectAll,
}

pub struct Fleet {
    requests: mpsc::Sender<Request>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Fleet {
    pub fn spawn(
        resolver: Arc<dyn HostResolver>,
        connector: Arc<dyn ShellConnector>,
        settings: Arc<ClientSettings>,
    ) -> (Self, mpsc::Receiver<FleetUpdate>) {
        let (requests, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (updates_tx, updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let worker = worker::Worker::new(resolver, connector, settings, updates_tx);
        let task = tokio::spawn(worker.run(requests_rx, shutdown.clone()));
        (
            Self {
                requests,
                shutdown,
                task,
            },
            updates,
        )
    }

    /// Resolves `filter` and reconciles the client set with it.
    pub async fn set_hosts(&self, filter: &str) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::SetHosts {
            filter: filter.to_string(),
            reply,
        })
        .await?;
        rx.await.context("fleet stopped before applying the host filter")?
    }

    /// Starts a query on every host; the merged result arrives later as [`FleetUpdate::QueryResult`].
    pub async fn query_logs(&self, params: QueryParams) -> Result<(), QueryRejected> {
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::QueryLogs { params, reply })
            .await
            .is_err()
        {
            return Err(QueryRejected::Closed);
        }
        rx.await.unwrap_or(Err(QueryRejected::Closed))
    }

    /// Forgets the query in flight; replies that still arrive for it are dropped.
    pub async fn abort_query(&self) -> anyhow::Result<()> {
        self.send(Request::AbortQuery).await
    }

    pub async fn reconnect_all(&self) -> anyhow::Result<()> {
        self.send(Request::ReconnectAll).await
    }

    pub async fn disconnect_all(&self) -> anyhow::Result<()> {
        self.send(Request::DisconnectAll).await
    }

    /// Begins tearing every client down; see [`Fleet::wait`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Waits until every client has been torn down after [`Fleet::close`].
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("fleet task failed")
    }

    async fn send(&self, request: Request) -> anyhow::Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("fleet has shut down"))
    }
}
