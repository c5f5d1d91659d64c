use std::io;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "logfleet.log";
const DEFAULT_DIRECTIVES: &str = "info";

pub(crate) struct LogOptions {
    pub(crate) dir: PathBuf,
    pub(crate) to_stderr: bool,
    /// Hosts whose client actors log at debug level.
    pub(crate) debug_hosts: Vec<String>,
}

/// Filter directives: `RUST_LOG` (or info) plus one debug directive per host span.
fn filter_directives(base: &str, debug_hosts: &[String]) -> anyhow::Result<String> {
    let mut directives = base.trim().to_string();
    for host in debug_hosts {
        let plain = |ch: char| ch.is_ascii_alphanumeric() || "._-@:".contains(ch);
        if host.is_empty() || !host.chars().all(plain) {
            anyhow::bail!("--debug-host {host:?} is not a plain host name");
        }
        if !directives.is_empty() {
            directives.push(',');
        }
        directives.push_str(&format!("[host{{host={host}}}]=debug"));
    }
    Ok(directives)
}

/// Daily JSON file under `dir`, plus human-readable stderr when asked.
pub(crate) fn init_tracing(
    options: &LogOptions,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(&options.dir)?;
    let file_appender = tracing_appender::rolling::daily(&options.dir, LOG_FILE);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    // The current span carries the host of client events.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(false)
        .json()
        .with_current_span(true)
        .with_span_list(false);

    let base = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| DEFAULT_DIRECTIVES.to_string());
    let filter = EnvFilter::try_new(filter_directives(&base, &options.debug_hosts)?)?;

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    if options.to_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact();
        registry.with(stderr_layer).init();
    } else {
        registry.init();
    }

    Ok(file_guard)
}
