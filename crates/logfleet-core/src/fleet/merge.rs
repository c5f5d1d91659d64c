//! Combines per-host query replies into one time-ordered result.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::client::ResumeCursor;
use crate::model::{LogMessage, MergedQueryResult, PerHostQueryResult, QueryParams};

/// Messages kept per host across "load earlier" pages, oldest first.
#[derive(Debug, Default, Clone)]
pub(crate) struct Retained {
    pub messages: Vec<LogMessage>,
    /// The host's last reply hit the line cap, so older matches may exist.
    pub truncated: bool,
}

impl Retained {
    /// Cursor for the next page: strictly before the oldest message kept so far.
    pub fn resume_cursor(&self) -> Option<ResumeCursor> {
        let oldest = self.messages.first()?;
        let same_time_count = self
            .messages
            .iter()
            .take_while(|message| message.time == oldest.time)
            .count();
        Some(ResumeCursor {
            combined_line: oldest.combined_linenumber,
            time: oldest.time,
            same_time_count,
        })
    }
}

pub(crate) fn error_result(
    errors: &BTreeMap<String, String>,
    load_earlier: bool,
    elapsed: Duration,
) -> MergedQueryResult {
    MergedQueryResult {
        errors: errors
            .iter()
            .map(|(host, error)| format!("{host}: {error}"))
            .collect(),
        load_earlier,
        elapsed,
        ..MergedQueryResult::default()
    }
}

pub(crate) fn merge(
    retained: &mut BTreeMap<String, Retained>,
    replies: BTreeMap<String, PerHostQueryResult>,
    params: &QueryParams,
    load_earlier: bool,
    elapsed: Duration,
) -> MergedQueryResult {
    if !load_earlier {
        retained.clear();
    }
    let mut histogram = BTreeMap::new();
    for (host, reply) in replies {
        for (minute, count) in &reply.histogram {
            *histogram.entry(*minute).or_insert(0) += count;
        }
        let truncated = params.max_lines > 0 && reply.messages.len() == params.max_lines;
        let entry = retained.entry(host).or_default();
        entry.truncated = truncated;
        if load_earlier {
            let mut messages = reply.messages;
            messages.append(&mut entry.messages);
            entry.messages = messages;
        } else {
            entry.messages = reply.messages;
        }
    }

    let cutoff = coverage_cutoff(retained);
    let mut messages: Vec<LogMessage> = retained
        .values()
        .flat_map(|host| host.messages.iter().cloned())
        .collect();
    messages.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.source().cmp(b.source())));
    if let Some(cutoff) = cutoff {
        messages.retain(|message| message.time >= cutoff);
    }

    MergedQueryResult {
        num_msgs_total: histogram.values().sum(),
        histogram,
        messages,
        load_earlier,
        coverage_from: cutoff.or(params.from),
        errors: Vec::new(),
        elapsed,
    }
}

/// Latest "oldest retained message" among hosts that hit the cap; nothing before it is complete.
fn coverage_cutoff(retained: &BTreeMap<String, Retained>) -> Option<DateTime<Utc>> {
    retained
        .values()
        .filter(|host| host.truncated)
        .filter_map(|host| host.messages.first().map(|message| message.time))
        .max()
}
