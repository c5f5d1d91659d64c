use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const CONTEXT_SOURCE: &str = "source";
pub const CONTEXT_HOSTNAME: &str = "hostname";
pub const CONTEXT_PROGRAM: &str = "program";
pub const CONTEXT_PID: &str = "pid";
pub const CONTEXT_LEVEL: &str = "level";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SudoMode {
    #[default]
    Disabled,
    /// The whole agent invocation runs under `sudo -n`.
    FullCommand,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShellOptions {
    pub sudo: SudoMode,
    /// Written to the shell before the agent is bootstrapped, one per line.
    pub init_commands: Vec<String>,
}

/// One log source on one host: where to connect and which two files to read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogStream {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub jumphost: Option<String>,
    pub logfile_last: String,
    pub logfile_prev: String,
    pub shell: ShellOptions,
}

impl LogStream {
    pub fn is_local(&self) -> bool {
        self.host == "localhost" && self.user.is_none() && self.port.is_none() && self.jumphost.is_none()
    }

    /// `user@host` as understood by `ssh`; the port travels separately.
    pub fn ssh_destination(&self) -> String {
        match self.user.as_deref() {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ConnectedIdle,
    ConnectedBusy,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::ConnectedIdle | Self::ConnectedBusy)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    pub time: DateTime<Utc>,
    /// Set when the parsed timestamp went backwards and was clamped to the previous message.
    pub decreased_timestamp: bool,
    pub msg: String,
    pub context: BTreeMap<String, String>,
    pub orig_line: String,
    pub log_filename: String,
    pub log_linenumber: u64,
    pub combined_linenumber: u64,
}

impl LogMessage {
    pub fn source(&self) -> &str {
        self.context
            .get(CONTEXT_SOURCE)
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PerHostQueryResult {
    /// Unix timestamp of the minute start -> number of matching lines.
    pub histogram: BTreeMap<i64, u64>,
    pub messages: Vec<LogMessage>,
    pub errors: Vec<String>,
    pub debug_info: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergedQueryResult {
    pub histogram: BTreeMap<i64, u64>,
    pub messages: Vec<LogMessage>,
    pub num_msgs_total: u64,
    pub load_earlier: bool,
    /// Earliest instant for which every host's messages are known to be complete.
    pub coverage_from: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub elapsed: Duration,
}

impl MergedQueryResult {
    pub fn is_error(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Filter expression, passed to the agent verbatim.
    pub query: String,
    pub max_lines: usize,
    /// Continue the previous query further back in time instead of starting over.
    pub load_earlier: bool,
    pub refresh_index: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            query: String::new(),
            max_lines: 250,
            load_earlier: false,
            refresh_index: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BusyStage {
    pub num: u32,
    pub title: String,
    pub extra: Option<String>,
    pub percentage: u8,
}

/// Transient diagnostics shown while a host is (re)connecting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnDetails {
    pub attempt: u64,
    pub err: Option<String>,
    pub messages: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapIssue {
    pub err: Option<String>,
    pub warn_no_admin_access: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub disconnected: usize,
    pub connecting: usize,
    pub idle: usize,
    pub busy: usize,
    pub disconnecting: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Disconnected => self.disconnected += 1,
            ConnectionState::Connecting => self.connecting += 1,
            ConnectionState::ConnectedIdle => self.idle += 1,
            ConnectionState::ConnectedBusy => self.busy += 1,
            ConnectionState::Disconnecting => self.disconnecting += 1,
        }
    }

    pub fn not_connected(&self) -> usize {
        self.disconnected + self.connecting + self.disconnecting
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FleetSnapshot {
    pub states: BTreeMap<String, ConnectionState>,
    pub conn_details: BTreeMap<String, ConnDetails>,
    pub busy_stages: BTreeMap<String, BusyStage>,
    pub counts: StateCounts,
    pub tearing_down: Vec<String>,
    pub connected: bool,
    pub busy: bool,
    pub no_matching_hosts: bool,
}
