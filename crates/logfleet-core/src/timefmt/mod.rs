//! Timestamp layout detection and the extraction rules handed to the agent.

mod layout;

use std::ops::Range;

use chrono::format::{Item, ParseError, Parsed};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use protocol::agent::ExtractionRules;
use thiserror::Error;

/// Layouts tried by [`detect_layout`], in order.
pub const KNOWN_LAYOUTS: &[&str] = &[
    "Jan _2 15:04:05",
    "2006-01-02T15:04:05.000000Z07:00",
    "2006-01-02T15:04:05.000000-0700",
    "2006-01-02 15:04:05.000000",
    "02/Jan/2006:15:04:05 -0700",
];

/// Longest line prefix tried when probing a layout.
const MAX_PREFIX_LEN: usize = 64;

/// Stand-in year for layouts without one; a leap year so that Feb 29 parses.
const PLACEHOLDER_YEAR: i64 = 2000;

/// Offset tokens, longest first; they follow the seconds so they are not digit-isolated.
const OFFSET_TOKENS: &[&str] = &["Z07:00", "-07:00", "-0700"];

/// Host-local time format of the agent's `--from`/`--to` bounds.
pub const AGENT_MINUTE_FORMAT: &str = "%Y-%m-%d-%H:%M";
pub const AGENT_SECOND_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeFormatError {
    #[error("no known timestamp layout matches {0:?}")]
    Undetected(String),
    #[error("layout {layout:?} has no {component} component")]
    MissingComponent {
        layout: &'static str,
        component: &'static str,
    },
    #[error("layout {0:?} has seconds inside the minute key")]
    SecondsInMinuteKey(&'static str),
    #[error("failed to parse timestamp from {input:?}: {reason}")]
    Parse { input: String, reason: String },
}

impl TimeFormatError {
    fn parse(input: &str, reason: impl ToString) -> Self {
        Self::Parse {
            input: input.chars().take(MAX_PREFIX_LEN).collect(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Component {
    start: usize,
    token: &'static str,
}

impl Component {
    fn end(&self) -> usize {
        self.start + self.token.len()
    }

    /// 1-based awk `substr` of this component, with a leading space read as `0`.
    fn rule(&self) -> String {
        let first = self.start + 1;
        if self.token.starts_with('_') {
            return format!(
                "(substr($0, {first}, 1) == \" \" ? \"0\" substr($0, {}, 1) : substr($0, {first}, {}))",
                first + 1,
                self.token.len()
            );
        }
        substr_rule(self.start, self.token.len())
    }

    /// `Z07:00` may be a bare `Z`; the other offset forms have a fixed width.
    fn offset_rule(&self) -> String {
        if self.token.starts_with('Z') {
            let first = self.start + 1;
            return format!(
                "(substr($0, {first}, 1) == \"Z\" ? \"Z\" : substr($0, {first}, {}))",
                self.token.len()
            );
        }
        substr_rule(self.start, self.token.len())
    }
}

fn substr_rule(start: usize, len: usize) -> String {
    format!("substr($0, {}, {len})", start + 1)
}

/// How to read timestamps of one log: the parser the client uses and the rules the agent uses.
#[derive(Debug, Clone)]
pub struct TimeFormat {
    pub layout: &'static str,
    /// Month-to-minute part of the layout; the key also carries the line's offset, if any.
    pub minute_key_layout: &'static str,
    /// Byte range of the minute key within a line that starts with a timestamp.
    pub minute_key_span: Range<usize>,
    /// Offset token appended to the minute key after a space.
    pub minute_key_offset: Option<&'static str>,
    pub rules: ExtractionRules,
    has_year: bool,
    minute_key_has_year: bool,
    items: Vec<Item<'static>>,
    minute_key_items: Vec<Item<'static>>,
}

impl TimeFormat {
    pub fn has_year(&self) -> bool {
        self.has_year
    }

    /// Parses the timestamp at the start of `line` and returns it with the rest of the line.
    pub fn parse_prefix<'s>(
        &self,
        line: &'s str,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, &'s str), TimeFormatError> {
        let mut parsed = Parsed::new();
        let rest = chrono::format::parse_and_remainder(&mut parsed, line, self.items.iter())
            .map_err(|err| TimeFormatError::parse(line, err))?;
        let time = resolve(parsed, self.has_year, tz, now)
            .map_err(|err| TimeFormatError::parse(line, err))?;
        Ok((time, rest))
    }

    /// Parses a histogram minute key as printed by the agent.
    pub fn parse_minute_key(
        &self,
        key: &str,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TimeFormatError> {
        let mut parsed = Parsed::new();
        chrono::format::parse(&mut parsed, key, self.minute_key_items.iter())
            .map_err(|err| TimeFormatError::parse(key, err))?;
        resolve(parsed, self.minute_key_has_year, tz, now)
            .map_err(|err| TimeFormatError::parse(key, err))
    }

    pub fn format_minute_key(&self, time: DateTime<Utc>, tz: Tz) -> String {
        time.with_timezone(&tz)
            .format_with_items(self.minute_key_items.iter())
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
enum ResolveError {
    #[error("{0}")]
    Chrono(ParseError),
    #[error("no such local time")]
    Nonexistent,
}

impl From<ParseError> for ResolveError {
    fn from(err: ParseError) -> Self {
        Self::Chrono(err)
    }
}

fn resolve(
    mut parsed: Parsed,
    has_year: bool,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ResolveError> {
    if !has_year {
        parsed.set_year(PLACEHOLDER_YEAR)?;
    }
    let mut naive = parsed.to_naive_datetime_with_offset(0)?;
    if !has_year {
        let local_now = now.with_timezone(&tz).naive_local();
        naive = naive
            .with_year(infer_year(&local_now, &naive))
            .ok_or(ResolveError::Nonexistent)?;
    }
    // An offset written in the line wins over the host's zone.
    match parsed.offset {
        Some(seconds) => FixedOffset::east_opt(seconds)
            .and_then(|offset| offset.from_local_datetime(&naive).single())
            .map(|time| time.with_timezone(&Utc))
            .ok_or(ResolveError::Nonexistent),
        None => localize(naive, tz),
    }
}

fn localize(naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Utc>, ResolveError> {
    // Local times skipped by a DST jump are moved past the gap.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|time| time.with_timezone(&Utc))
        .ok_or(ResolveError::Nonexistent)
}

fn prefixes(line: &str) -> impl Iterator<Item = &str> {
    line.char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .take_while(|end| *end <= MAX_PREFIX_LEN)
        .map(move |end| &line[..end])
}

fn detect_index(line: &str) -> Option<usize> {
    KNOWN_LAYOUTS.iter().position(|layout| {
        let items = layout::compile(layout);
        prefixes(line).any(|prefix| {
            chrono::format::parse(&mut Parsed::new(), prefix, items.iter()).is_ok()
        })
    })
}

/// Returns the first known layout that parses some prefix of `line`.
pub fn detect_layout(line: &str) -> Option<&'static str> {
    detect_index(line).map(|idx| KNOWN_LAYOUTS[idx])
}

/// Picks the layout most example lines agree on; ties go to the earlier known layout.
pub fn detect_common_layout<S: AsRef<str>>(lines: &[S]) -> Result<&'static str, TimeFormatError> {
    let mut votes = [0usize; KNOWN_LAYOUTS.len()];
    for line in lines {
        if let Some(idx) = detect_index(line.as_ref()) {
            votes[idx] += 1;
        }
    }
    let mut best: Option<usize> = None;
    for (idx, count) in votes.iter().enumerate() {
        if *count > 0 && best.map_or(true, |best| *count > votes[best]) {
            best = Some(idx);
        }
    }
    best.map(|idx| KNOWN_LAYOUTS[idx]).ok_or_else(|| {
        let sample = lines.first().map(|line| line.as_ref()).unwrap_or_default();
        TimeFormatError::Undetected(sample.to_string())
    })
}

/// A component token may not touch another digit or `_`.
fn is_isolated(layout: &str, start: usize, len: usize) -> bool {
    let bytes = layout.as_bytes();
    let joins = |byte: u8| byte.is_ascii_digit() || byte == b'_';
    let before = start.checked_sub(1).map(|idx| bytes[idx]);
    let after = bytes.get(start + len).copied();
    !before.is_some_and(joins) && !after.is_some_and(joins)
}

fn find_component(layout: &str, candidates: &[&'static str]) -> Option<Component> {
    candidates.iter().find_map(|token| {
        layout
            .match_indices(token)
            .map(|(start, _)| start)
            .find(|start| is_isolated(layout, *start, token.len()))
            .map(|start| Component { start, token: *token })
    })
}

pub fn derive_descriptor(layout: &'static str) -> Result<TimeFormat, TimeFormatError> {
    let missing = |component| TimeFormatError::MissingComponent { layout, component };
    let year = find_component(layout, &["2006"]);
    let month = find_component(layout, &["Jan", "01"]).ok_or_else(|| missing("month"))?;
    let day = find_component(layout, &["_2", "02"]).ok_or_else(|| missing("day"))?;
    let hhmm = find_component(layout, &["15:04"]).ok_or_else(|| missing("hour-minute"))?;
    let seconds = find_component(layout, &["05"]);
    let offset = OFFSET_TOKENS.iter().find_map(|token| {
        layout
            .find(token)
            .map(|start| Component { start, token: *token })
    });

    let start = month.start.min(day.start).min(hhmm.start);
    let end = month.end().max(day.end()).max(hhmm.end());
    let span = start..end;
    if seconds.is_some_and(|seconds| span.contains(&seconds.start)) {
        return Err(TimeFormatError::SecondsInMinuteKey(layout));
    }

    let month_rule = if month.token == "Jan" {
        format!("monthByName[{}]", month.rule())
    } else {
        month.rule()
    };
    let year_rule = match year {
        Some(year) => year.rule(),
        None => format!("yearByMonth[{month_rule} + 0]"),
    };
    let rules = ExtractionRules {
        month: month_rule,
        year: year_rule,
        day: day.rule(),
        hhmm: hhmm.rule(),
        minute_key: match offset {
            Some(offset) => format!(
                "{} \" \" {}",
                substr_rule(start, end - start),
                offset.offset_rule()
            ),
            None => substr_rule(start, end - start),
        },
    };
    let minute_key_layout = &layout[span.clone()];
    let mut minute_key_items = layout::compile(minute_key_layout);
    if let Some(offset) = offset {
        minute_key_items.push(Item::Space(" "));
        minute_key_items.extend(layout::compile(offset.token));
    }
    Ok(TimeFormat {
        layout,
        minute_key_layout,
        minute_key_span: span.clone(),
        minute_key_offset: offset.map(|offset| offset.token),
        rules,
        has_year: year.is_some(),
        minute_key_has_year: year.is_some_and(|year| span.contains(&year.start)),
        items: layout::compile(layout),
        minute_key_items,
    })
}

fn year_for_month(now: &impl Datelike, month: u32) -> i32 {
    match (now.month(), month) {
        (1, 12) => now.year() - 1,
        (12, 1) => now.year() + 1,
        _ => now.year(),
    }
}

/// Year of a timestamp logged without one, relative to `now` on the same host.
pub fn infer_year(now: &impl Datelike, parsed: &impl Datelike) -> i32 {
    year_for_month(now, parsed.month())
}

/// The `month:year` table sent to the agent for layouts without a year.
pub fn years_by_month(now: &impl Datelike) -> Vec<(u32, i32)> {
    (1..=12).map(|month| (month, year_for_month(now, month))).collect()
}

/// Loads an IANA zone name as reported by the host.
pub fn host_timezone(name: &str) -> Option<Tz> {
    name.trim().parse().ok()
}

pub fn format_host_local(time: DateTime<Utc>, tz: Tz, format: &str) -> String {
    time.with_timezone(&tz).format(format).to_string()
}
