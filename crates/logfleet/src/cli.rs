use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "logfleet",
    version,
    about = "Query log files on many hosts over ssh and merge the results"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "~/.config/logfleet/config.toml")]
    pub(crate) config: String,
    /// Comma-separated host names, globs over configured names, or `[user@]host[:port]`.
    #[arg(long, default_value = "*")]
    pub(crate) hosts: String,
    /// Filter expression handed to the agent unchanged.
    #[arg(long, default_value = "")]
    pub(crate) query: String,
    /// Lower bound: a duration ago (`2h`, `30m`) or an RFC 3339 instant.
    #[arg(long, value_parser = parse_time_arg)]
    pub(crate) from: Option<DateTime<Utc>>,
    /// Upper bound, same forms as `--from`.
    #[arg(long, value_parser = parse_time_arg)]
    pub(crate) to: Option<DateTime<Utc>>,
    #[arg(long, default_value_t = 250)]
    pub(crate) max_lines: usize,
    /// Extra "load earlier" pages fetched after the first result.
    #[arg(long, default_value_t = 0)]
    pub(crate) pages: u32,
    #[arg(long)]
    pub(crate) refresh_index: bool,
    #[arg(long)]
    pub(crate) json: bool,
    /// How long to wait for every host to connect before giving up.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub(crate) connect_wait: Duration,
    #[arg(long, default_value = "~/.local/state/logfleet/logs")]
    pub(crate) log_dir: String,
    #[arg(long)]
    pub(crate) log_to_stderr: bool,
    /// Log debug events of this host; repeatable.
    #[arg(long = "debug-host", value_name = "NAME")]
    pub(crate) debug_hosts: Vec<String>,
}

pub(crate) fn parse_time_arg(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&Utc));
    }
    let ago = humantime::parse_duration(raw)
        .map_err(|err| format!("expected a duration like 2h or an RFC 3339 time: {err}"))?;
    let ago = chrono::Duration::from_std(ago).map_err(|err| err.to_string())?;
    Ok(Utc::now() - ago)
}
