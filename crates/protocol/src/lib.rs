//! Line grammar of the remote log agent.
//!
//! The agent is a shell script driven over an interactive shell session. Everything it
//! prints is line-oriented text; this crate classifies those lines without doing any I/O.

use thiserror::Error;

pub mod agent;
pub mod framing;

pub const RESET_OUTPUT: &str = "reset_output";
pub const COMMAND_DONE_PREFIX: &str = "command_done:";
pub const EXIT_CODE_PREFIX: &str = "exit_code:";
pub const HOST_TIMEZONE_PREFIX: &str = "host_timezone:";
pub const EXAMPLE_LOG_LINE_PREFIX: &str = "example_log_line:";
pub const BOOTSTRAP_OK: &str = "bootstrap ok";
pub const BOOTSTRAP_FAILED: &str = "bootstrap failed";
pub const BUCKET_PREFIX: &str = "s:";
pub const LOGFILE_PREFIX: &str = "logfile:";
pub const MESSAGE_PREFIX: &str = "m:";
pub const ERROR_PREFIX: &str = "error:";
pub const NO_ADMIN_ACCESS_WARNING: &str = "warn_journalctl_no_admin_access";
pub const STAGE_PREFIX: &str = "p:stage:";
pub const PERCENTAGE_PREFIX: &str = "p:p:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed {kind} line: {line:?}")]
    Malformed { kind: &'static str, line: String },
}

impl ProtocolError {
    fn malformed(kind: &'static str, line: &str) -> Self {
        Self::Malformed {
            kind,
            line: line.to_string(),
        }
    }
}

/// Markers the client itself echoes around every command; they show up on both streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Reset,
    CommandDone(u64),
}

pub fn parse_marker(line: &str) -> Option<Marker> {
    if line == RESET_OUTPUT {
        return Some(Marker::Reset);
    }
    let idx = line.strip_prefix(COMMAND_DONE_PREFIX)?;
    idx.trim().parse().ok().map(Marker::CommandDone)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutLine<'a> {
    HostTimezone(&'a str),
    ExampleLogLine(&'a str),
    BootstrapOk,
    BootstrapFailed,
    Bucket { minute_key: &'a str, count: u64 },
    LogFile { name: &'a str, line_count: u64 },
    Message { combined_line: u64, raw: &'a str },
    Error(&'a str),
    ExitCode(i32),
    Other(&'a str),
}

pub fn parse_stdout_line(line: &str) -> Result<StdoutLine<'_>, ProtocolError> {
    if let Some(rest) = line.strip_prefix(MESSAGE_PREFIX) {
        let (num, raw) = rest
            .split_once(':')
            .ok_or_else(|| ProtocolError::malformed("message", line))?;
        let combined_line = num
            .parse()
            .map_err(|_| ProtocolError::malformed("message", line))?;
        return Ok(StdoutLine::Message { combined_line, raw });
    }
    if let Some(rest) = line.strip_prefix(BUCKET_PREFIX) {
        let (minute_key, count) = rest
            .rsplit_once(',')
            .ok_or_else(|| ProtocolError::malformed("histogram", line))?;
        let count = count
            .trim()
            .parse()
            .map_err(|_| ProtocolError::malformed("histogram", line))?;
        return Ok(StdoutLine::Bucket { minute_key, count });
    }
    if let Some(rest) = line.strip_prefix(LOGFILE_PREFIX) {
        let (name, line_count) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::malformed("logfile", line))?;
        let line_count = line_count
            .trim()
            .parse()
            .map_err(|_| ProtocolError::malformed("logfile", line))?;
        return Ok(StdoutLine::LogFile { name, line_count });
    }
    if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        return Ok(StdoutLine::Error(rest));
    }
    if let Some(rest) = line.strip_prefix(EXIT_CODE_PREFIX) {
        let code = rest
            .trim()
            .parse()
            .map_err(|_| ProtocolError::malformed("exit code", line))?;
        return Ok(StdoutLine::ExitCode(code));
    }
    if let Some(rest) = line.strip_prefix(HOST_TIMEZONE_PREFIX) {
        return Ok(StdoutLine::HostTimezone(rest.trim()));
    }
    if let Some(rest) = line.strip_prefix(EXAMPLE_LOG_LINE_PREFIX) {
        return Ok(StdoutLine::ExampleLogLine(rest));
    }
    match line {
        BOOTSTRAP_OK => Ok(StdoutLine::BootstrapOk),
        BOOTSTRAP_FAILED => Ok(StdoutLine::BootstrapFailed),
        other => Ok(StdoutLine::Other(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StderrLine<'a> {
    NoAdminAccess,
    Stage {
        num: u32,
        title: &'a str,
        extra: Option<&'a str>,
    },
    Percentage(u8),
    Other(&'a str),
}

pub fn parse_stderr_line(line: &str) -> Result<StderrLine<'_>, ProtocolError> {
    if line == NO_ADMIN_ACCESS_WARNING {
        return Ok(StderrLine::NoAdminAccess);
    }
    if let Some(rest) = line.strip_prefix(STAGE_PREFIX) {
        let mut parts = rest.splitn(3, ':');
        let num = parts
            .next()
            .and_then(|num| num.trim().parse().ok())
            .ok_or_else(|| ProtocolError::malformed("progress stage", line))?;
        let title = parts
            .next()
            .ok_or_else(|| ProtocolError::malformed("progress stage", line))?;
        let extra = parts.next().filter(|extra| !extra.is_empty());
        return Ok(StderrLine::Stage { num, title, extra });
    }
    if let Some(rest) = line.strip_prefix(PERCENTAGE_PREFIX) {
        let percentage: f64 = rest
            .trim()
            .parse()
            .ok()
            .filter(|percentage: &f64| percentage.is_finite())
            .ok_or_else(|| ProtocolError::malformed("progress percentage", line))?;
        return Ok(StderrLine::Percentage(percentage.clamp(0.0, 100.0) as u8));
    }
    Ok(StderrLine::Other(line))
}
