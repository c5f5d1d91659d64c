//! Command-line arguments understood by the remote agent script.

/// Awk expressions that pull the timestamp components out of a raw log line (`$0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRules {
    pub month: String,
    pub year: String,
    pub day: String,
    pub hhmm: String,
    pub minute_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapArgs {
    pub logfile_last: String,
    pub logfile_prev: String,
}

impl BootstrapArgs {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "logstream_info".to_string(),
            "--logfile-last".to_string(),
            self.logfile_last.clone(),
            "--logfile-prev".to_string(),
            self.logfile_prev.clone(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryArgs {
    pub logfile_last: String,
    pub logfile_prev: String,
    pub index_file: String,
    pub max_lines: usize,
    /// Inclusive lower bound, already rendered in the host's local time (`%Y-%m-%d-%H:%M`).
    pub from: Option<String>,
    /// Inclusive upper bound, same rendering as `from`.
    pub to: Option<String>,
    /// Only lines with a combined line number strictly below this one.
    pub lines_until: Option<u64>,
    pub timestamp_until_seconds: Option<String>,
    pub timestamp_until_precise: Option<String>,
    pub skip_n_latest: usize,
    pub refresh_index: bool,
    pub gzip: bool,
    pub years_by_month: Vec<(u32, i32)>,
    pub rules: ExtractionRules,
    pub filter: String,
}

impl QueryArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "query".to_string(),
            "--logfile-last".to_string(),
            self.logfile_last.clone(),
            "--logfile-prev".to_string(),
            self.logfile_prev.clone(),
            "--cache-file".to_string(),
            self.index_file.clone(),
            "--max-num-lines".to_string(),
            self.max_lines.to_string(),
        ];
        push_opt(&mut args, "--from", self.from.as_deref());
        push_opt(&mut args, "--to", self.to.as_deref());
        if let Some(lines_until) = self.lines_until {
            args.push("--lines-until".to_string());
            args.push(lines_until.to_string());
        }
        push_opt(
            &mut args,
            "--timestamp-until-seconds",
            self.timestamp_until_seconds.as_deref(),
        );
        push_opt(
            &mut args,
            "--timestamp-until-precise",
            self.timestamp_until_precise.as_deref(),
        );
        if self.skip_n_latest > 0 {
            args.push("--skip-n-latest".to_string());
            args.push(self.skip_n_latest.to_string());
        }
        if self.refresh_index {
            args.push("--refresh-index".to_string());
        }
        if self.gzip {
            args.push("--gzip".to_string());
        }
        if !self.years_by_month.is_empty() {
            let years = self
                .years_by_month
                .iter()
                .map(|(month, year)| format!("{month}:{year}"))
                .collect::<Vec<_>>()
                .join(" ");
            args.push("--years-by-month".to_string());
            args.push(years);
        }
        args.push("--awk-month".to_string());
        args.push(self.rules.month.clone());
        args.push("--awk-year".to_string());
        args.push(self.rules.year.clone());
        args.push("--awk-day".to_string());
        args.push(self.rules.day.clone());
        args.push("--awk-hhmm".to_string());
        args.push(self.rules.hhmm.clone());
        args.push("--awk-minute-key".to_string());
        args.push(self.rules.minute_key.clone());
        if !self.filter.trim().is_empty() {
            args.push("--".to_string());
            args.push(self.filter.clone());
        }
        args
    }
}

fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(value) = value {
        args.push(flag.to_string());
        args.push(value.to_string());
    }
}

/// Renders a shell command line with every argument quoted as needed.
pub fn command_line(program: &[&str], args: &[String]) -> String {
    shell_words::join(
        program
            .iter()
            .copied()
            .chain(args.iter().map(String::as_str)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExtractionRules {
        ExtractionRules {
            month: "monthByName[substr($0, 1, 3)]".to_string(),
            year: "yearByMonth[monthByName[substr($0, 1, 3)]]".to_string(),
            day: "substr($0, 5, 2)".to_string(),
            hhmm: "substr($0, 8, 5)".to_string(),
            minute_key: "substr($0, 1, 12)".to_string(),
        }
    }

    #[test]
    fn query_args_quote_filter_and_rules() {
        let args = QueryArgs {
            logfile_last: "/var/log/syslog".to_string(),
            logfile_prev: "/var/log/syslog.1".to_string(),
            index_file: "/tmp/logfleet_index".to_string(),
            max_lines: 250,
            from: Some("2024-03-01-10:00".to_string()),
            to: None,
            lines_until: Some(1200),
            timestamp_until_seconds: None,
            timestamp_until_precise: None,
            skip_n_latest: 0,
            refresh_index: false,
            gzip: true,
            years_by_month: vec![(1, 2024), (12, 2023)],
            rules: rules(),
            filter: "/sshd/ && !/CRON/".to_string(),
        };
        let line = command_line(&["bash", "/tmp/agent.sh"], &args.to_args());
        assert!(line.starts_with("bash /tmp/agent.sh query --logfile-last /var/log/syslog "));
        assert!(line.contains("--lines-until 1200"));
        assert!(line.contains("--years-by-month '1:2024 12:2023'"));
        assert!(line.contains("--awk-day 'substr($0, 5, 2)'"));
        assert!(line.ends_with("-- '/sshd/ && !/CRON/'"));
        assert!(!line.contains("--to"));
    }

    #[test]
    fn bootstrap_args_render_plainly() {
        let args = BootstrapArgs {
            logfile_last: "/var/log/messages".to_string(),
            logfile_prev: "/var/log/messages.1".to_string(),
        };
        assert_eq!(
            command_line(&["sh", "agent.sh"], &args.to_args()),
            "sh agent.sh logstream_info --logfile-last /var/log/messages --logfile-prev /var/log/messages.1"
        );
    }
}
