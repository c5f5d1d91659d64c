use logfleet_core::{MergedQueryResult, CONTEXT_LEVEL};
use std::io::Write;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub(crate) fn write_text(out: &mut impl Write, result: &MergedQueryResult) -> anyhow::Result<()> {
    if result.is_error() {
        for error in &result.errors {
            writeln!(out, "error: {error}")?;
        }
        return Ok(());
    }
    let width = result
        .messages
        .iter()
        .map(|message| message.source().len())
        .max()
        .unwrap_or(0);
    for message in &result.messages {
        let level = message
            .context
            .get(CONTEXT_LEVEL)
            .map(String::as_str)
            .unwrap_or("info");
        writeln!(
            out,
            "{} {:<width$} {:<5} {}",
            message.time.format(TIME_FORMAT),
            message.source(),
            level,
            message.msg,
        )?;
    }
    write!(
        out,
        "-- {} of {} matching lines",
        result.messages.len(),
        result.num_msgs_total
    )?;
    if let Some(from) = result.coverage_from {
        write!(out, ", complete from {}", from.format(TIME_FORMAT))?;
    }
    writeln!(out, " ({} ms)", result.elapsed.as_millis())?;
    Ok(())
}

pub(crate) fn write_json(out: &mut impl Write, result: &MergedQueryResult) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, result)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use logfleet_core::{LogMessage, CONTEXT_SOURCE};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn result() -> MergedQueryResult {
        let time = Utc
            .with_ymd_and_hms(2024, 3, 5, 10, 0, 0)
            .single()
            .expect("valid time");
        let mut context = BTreeMap::new();
        context.insert(CONTEXT_SOURCE.to_string(), "web1".to_string());
        context.insert(CONTEXT_LEVEL.to_string(), "warn".to_string());
        MergedQueryResult {
            messages: vec![LogMessage {
                time,
                decreased_timestamp: false,
                msg: "disk almost full".to_string(),
                context,
                orig_line: String::new(),
                log_filename: "/var/log/syslog".to_string(),
                log_linenumber: 3,
                combined_linenumber: 3,
            }],
            num_msgs_total: 7,
            coverage_from: Some(time),
            elapsed: Duration::from_millis(12),
            ..MergedQueryResult::default()
        }
    }

    #[test]
    fn text_lists_messages_and_a_summary() {
        let mut out = Vec::new();
        write_text(&mut out, &result()).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "2024-03-05 10:00:00.000 web1 warn  disk almost full");
        assert_eq!(
            lines[1],
            "-- 1 of 7 matching lines, complete from 2024-03-05 10:00:00.000 (12 ms)"
        );
    }

    #[test]
    fn errors_replace_the_listing() {
        let failed = MergedQueryResult {
            errors: vec!["web1: connection lost".to_string()],
            ..MergedQueryResult::default()
        };
        let mut out = Vec::new();
        write_text(&mut out, &failed).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), "error: web1: connection lost\n");
    }

    #[test]
    fn json_is_one_line_per_result() {
        let mut out = Vec::new();
        write_json(&mut out, &result()).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["num_msgs_total"], 7);
        assert_eq!(value["messages"][0]["msg"], "disk almost full");
    }
}
