//! Parse state of the command currently running on a client.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use protocol::framing::{decompress_lines, GzipFrame, GZIP_END, GZIP_START};
use protocol::{
    parse_marker, parse_stderr_line, parse_stdout_line, Marker, StderrLine, StdoutLine,
    EXIT_CODE_PREFIX,
};
use regex::Regex;
use tracing::debug;

use crate::model::{
    LogMessage, PerHostQueryResult, CONTEXT_HOSTNAME, CONTEXT_LEVEL, CONTEXT_PID, CONTEXT_PROGRAM,
    CONTEXT_SOURCE,
};
use crate::timefmt::{self, TimeFormat};

/// Output lines kept in an error summary.
const SUMMARY_TAIL_LINES: usize = 10;

static SYSLOG_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+([^\s\[\]:]+)(?:\[(\d+)\])?:\s?(.*)$")
        .expect("SYSLOG_HEADER is a valid regex pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutStream {
    Stdout,
    Stderr,
}

impl OutStream {
    fn index(self) -> usize {
        match self {
            Self::Stdout => 0,
            Self::Stderr => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    Stage {
        num: u32,
        title: String,
        extra: Option<String>,
    },
    Percentage(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    Pending,
    Progress(Progress),
    /// Both done sentinels have been seen.
    Finished,
}

#[derive(Debug)]
pub(crate) struct BootstrapOutcome {
    pub timezone: Tz,
    /// Set when the host reported a zone that could not be loaded.
    pub unknown_timezone: Option<String>,
    pub time_format: TimeFormat,
    pub warn_no_admin_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootstrapFailure {
    pub err: String,
    pub warn_no_admin_access: bool,
}

#[derive(Debug)]
pub(crate) enum Finished {
    Bootstrap(Result<BootstrapOutcome, BootstrapFailure>),
    /// Ping output is only diagnostic; the reply is always a success.
    Ping { diagnostics: Option<String> },
    Query {
        result: PerHostQueryResult,
        error: Option<String>,
    },
}

#[derive(Debug, Default)]
struct BootstrapState {
    timezone: Option<String>,
    examples: Vec<String>,
    ok: Option<bool>,
    warn_no_admin_access: bool,
}

#[derive(Debug)]
struct QueryState {
    source: String,
    timezone: Tz,
    now: DateTime<Utc>,
    time_format: Arc<TimeFormat>,
    result: PerHostQueryResult,
    logfiles: Vec<(String, u64)>,
    last_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum Kind {
    Bootstrap(BootstrapState),
    Ping,
    Query(Box<QueryState>),
}

#[derive(Debug)]
pub(crate) struct CommandContext {
    pub idx: u64,
    reset_seen: [bool; 2],
    done: [bool; 2],
    gzip: Option<GzipFrame>,
    unhandled: Vec<String>,
    errors: Vec<String>,
    exit_code: Option<i32>,
    kind: Kind,
}

impl CommandContext {
    fn new(idx: u64, kind: Kind) -> Self {
        Self {
            idx,
            reset_seen: [false; 2],
            done: [false; 2],
            gzip: None,
            unhandled: Vec::new(),
            errors: Vec::new(),
            exit_code: None,
            kind,
        }
    }

    pub fn bootstrap(idx: u64) -> Self {
        Self::new(idx, Kind::Bootstrap(BootstrapState::default()))
    }

    pub fn ping(idx: u64) -> Self {
        Self::new(idx, Kind::Ping)
    }

    pub fn query(
        idx: u64,
        source: &str,
        timezone: Tz,
        time_format: Arc<TimeFormat>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            idx,
            Kind::Query(Box::new(QueryState {
                source: source.to_string(),
                timezone,
                now,
                time_format,
                result: PerHostQueryResult::default(),
                logfiles: Vec::new(),
                last_time: None,
            })),
        )
    }

    pub fn is_finished(&self) -> bool {
        self.done.iter().all(|done| *done)
    }

    /// Feeds one raw line (without its `\n`) from either output stream.
    pub fn handle_line(&mut self, stream: OutStream, raw: &[u8]) -> LineOutcome {
        let idx = stream.index();
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches('\r');
        let marker = parse_marker(text);
        if stream == OutStream::Stdout && self.gzip.is_some() {
            match marker {
                Some(Marker::CommandDone(done_idx)) if done_idx == self.idx => {
                    self.abandon_gzip();
                }
                Some(Marker::Reset) => self.abandon_gzip(),
                _ => {
                    self.push_gzip(raw);
                    return LineOutcome::Pending;
                }
            }
        }

        match marker {
            Some(Marker::Reset) => {
                self.reset_seen[idx] = true;
                return LineOutcome::Pending;
            }
            Some(Marker::CommandDone(done_idx)) if done_idx == self.idx => {
                if self.reset_seen[idx] {
                    self.done[idx] = true;
                }
                return if self.is_finished() {
                    LineOutcome::Finished
                } else {
                    LineOutcome::Pending
                };
            }
            Some(Marker::CommandDone(_)) => return LineOutcome::Pending,
            None => {}
        }
        // Output from before our reset marker belongs to an earlier command.
        if !self.reset_seen[idx] || self.done[idx] {
            return LineOutcome::Pending;
        }

        match stream {
            OutStream::Stdout if text == GZIP_START => {
                self.gzip = Some(GzipFrame::new());
                LineOutcome::Pending
            }
            OutStream::Stdout => {
                self.handle_stdout_text(text);
                LineOutcome::Pending
            }
            OutStream::Stderr => self.handle_stderr_text(text),
        }
    }

    fn push_gzip(&mut self, raw: &[u8]) {
        let Some(payload) = self.gzip.as_mut().and_then(|frame| frame.push(raw)) else {
            return;
        };
        self.gzip = None;
        match decompress_lines(&payload) {
            Ok(lines) => {
                for line in lines {
                    self.handle_stdout_text(&line);
                }
            }
            Err(err) => self
                .errors
                .push(format!("failed to decompress output: {err}")),
        }
    }

    /// Closes a frame cut short by the command's own sentinels, keeping any exit code in it.
    fn abandon_gzip(&mut self) {
        let Some(frame) = self.gzip.take() else {
            return;
        };
        let partial = frame.abandon();
        self.errors.push(format!(
            "compressed output ended without {GZIP_END} after {} bytes",
            partial.len()
        ));
        let partial = String::from_utf8_lossy(&partial);
        for line in partial.lines() {
            let line = line.trim_end_matches('\r');
            if line.starts_with(EXIT_CODE_PREFIX) {
                self.handle_stdout_text(line);
            }
        }
    }

    fn handle_stdout_text(&mut self, text: &str) {
        let line = match parse_stdout_line(text) {
            Ok(line) => line,
            Err(err) => {
                self.errors.push(err.to_string());
                return;
            }
        };
        match (&mut self.kind, line) {
            (_, StdoutLine::ExitCode(code)) => self.exit_code = Some(code),
            (_, StdoutLine::Error(message)) => self.errors.push(message.to_string()),
            (Kind::Bootstrap(state), StdoutLine::HostTimezone(name)) => {
                state.timezone = Some(name.to_string());
            }
            (Kind::Bootstrap(state), StdoutLine::ExampleLogLine(example)) => {
                state.examples.push(example.to_string());
            }
            (Kind::Bootstrap(state), StdoutLine::BootstrapOk) => state.ok = Some(true),
            (Kind::Bootstrap(state), StdoutLine::BootstrapFailed) => state.ok = Some(false),
            (Kind::Query(state), StdoutLine::Bucket { minute_key, count }) => {
                match state
                    .time_format
                    .parse_minute_key(minute_key, state.timezone, state.now)
                {
                    Ok(minute) => {
                        *state.result.histogram.entry(minute.timestamp()).or_default() += count;
                    }
                    Err(err) => self.errors.push(err.to_string()),
                }
            }
            (Kind::Query(state), StdoutLine::LogFile { name, line_count }) => {
                state.logfiles.push((name.to_string(), line_count));
            }
            (Kind::Query(state), StdoutLine::Message { combined_line, raw }) => {
                if let Err(err) = state.push_message(combined_line, raw) {
                    self.errors.push(err);
                }
            }
            _ => self.unhandled.push(text.to_string()),
        }
    }

    fn handle_stderr_text(&mut self, text: &str) -> LineOutcome {
        // Stderr only carries progress and diagnostics; a bad line never fails the command.
        let line = match parse_stderr_line(text) {
            Ok(line) => line,
            Err(err) => {
                debug!(event = "client.stderr.malformed", idx = self.idx, error = %err);
                self.unhandled.push(text.to_string());
                return LineOutcome::Pending;
            }
        };
        match (&mut self.kind, line) {
            (Kind::Bootstrap(state), StderrLine::NoAdminAccess) => {
                state.warn_no_admin_access = true;
                LineOutcome::Pending
            }
            (Kind::Query(_), StderrLine::Stage { num, title, extra }) => {
                LineOutcome::Progress(Progress::Stage {
                    num,
                    title: title.to_string(),
                    extra: extra.map(str::to_string),
                })
            }
            (Kind::Query(_), StderrLine::Percentage(percentage)) => {
                LineOutcome::Progress(Progress::Percentage(percentage))
            }
            _ => {
                self.unhandled.push(text.to_string());
                LineOutcome::Pending
            }
        }
    }

    fn error_summary(&self) -> Option<String> {
        if !self.errors.is_empty() {
            return Some(self.errors.join("; "));
        }
        match self.exit_code {
            Some(code) if code != 0 => Some(format!(
                "command failed with exit code {code}: {}",
                self.output_tail()
            )),
            _ => None,
        }
    }

    fn output_tail(&self) -> String {
        let skip = self.unhandled.len().saturating_sub(SUMMARY_TAIL_LINES);
        self.unhandled[skip..].join("\n")
    }

    pub fn finish(self) -> Finished {
        let error = self.error_summary();
        let tail = self.output_tail();
        let debug_info = self.unhandled.join("\n");
        match self.kind {
            Kind::Ping => Finished::Ping { diagnostics: error },
            Kind::Query(state) => {
                let mut result = state.result;
                result.errors = self.errors;
                result.debug_info = debug_info;
                Finished::Query { result, error }
            }
            Kind::Bootstrap(state) => {
                let warn_no_admin_access = state.warn_no_admin_access;
                let fail = |err: String| {
                    Finished::Bootstrap(Err(BootstrapFailure {
                        err,
                        warn_no_admin_access,
                    }))
                };
                if state.ok != Some(true) {
                    let err = error.unwrap_or_else(|| {
                        if tail.is_empty() {
                            "bootstrap failed".to_string()
                        } else {
                            format!("bootstrap failed: {tail}")
                        }
                    });
                    return fail(err);
                }
                if state.examples.is_empty() {
                    return fail("no example log lines to detect timestamp format".to_string());
                }
                let time_format = match timefmt::detect_common_layout(&state.examples)
                    .and_then(timefmt::derive_descriptor)
                {
                    Ok(time_format) => time_format,
                    Err(err) => return fail(err.to_string()),
                };
                let reported = state.timezone.unwrap_or_default();
                let (timezone, unknown_timezone) = match timefmt::host_timezone(&reported) {
                    Some(timezone) => (timezone, None),
                    None => (Tz::UTC, Some(reported)),
                };
                Finished::Bootstrap(Ok(BootstrapOutcome {
                    timezone,
                    unknown_timezone,
                    time_format,
                    warn_no_admin_access,
                }))
            }
        }
    }
}

impl QueryState {
    fn push_message(&mut self, combined_line: u64, raw: &str) -> Result<(), String> {
        let (parsed, rest) = self
            .time_format
            .parse_prefix(raw, self.timezone, self.now)
            .map_err(|err| err.to_string())?;
        let (time, decreased_timestamp) = match self.last_time {
            Some(last) if parsed < last => (last, true),
            _ => (parsed, false),
        };
        self.last_time = Some(time);

        let mut context = BTreeMap::new();
        context.insert(CONTEXT_SOURCE.to_string(), self.source.clone());
        let rest = rest.trim_start();
        let msg = match SYSLOG_HEADER.captures(rest) {
            Some(caps) => {
                context.insert(CONTEXT_HOSTNAME.to_string(), caps[1].to_string());
                context.insert(CONTEXT_PROGRAM.to_string(), caps[2].to_string());
                if let Some(pid) = caps.get(3) {
                    context.insert(CONTEXT_PID.to_string(), pid.as_str().to_string());
                }
                caps[4].to_string()
            }
            None => rest.to_string(),
        };
        context.insert(CONTEXT_LEVEL.to_string(), infer_level(&msg).to_string());

        let (log_filename, log_linenumber) = locate_line(&self.logfiles, combined_line);
        self.result.messages.push(LogMessage {
            time,
            decreased_timestamp,
            msg,
            context,
            orig_line: raw.to_string(),
            log_filename,
            log_linenumber,
            combined_linenumber: combined_line,
        });
        Ok(())
    }
}

/// Maps a combined line number to a file and a line within it; newest registration first.
pub(crate) fn locate_line(logfiles: &[(String, u64)], combined_line: u64) -> (String, u64) {
    logfiles
        .iter()
        .rev()
        .find(|(_, offset)| combined_line > *offset)
        .map(|(name, offset)| (name.clone(), combined_line - offset))
        .unwrap_or_else(|| (String::new(), combined_line))
}

pub(crate) fn infer_level(msg: &str) -> &'static str {
    let lower = msg.to_ascii_lowercase();
    if ["error", "fatal", "crit", "panic"]
        .iter()
        .any(|word| lower.contains(word))
    {
        "error"
    } else if lower.contains("warn") {
        "warn"
    } else if lower.contains("debug") || lower.contains("trace") {
        "debug"
    } else {
        "info"
    }
}
