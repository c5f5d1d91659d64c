use anyhow::Context;
use async_trait::async_trait;
use logfleet_core::{HostResolver, LogStream, ShellOptions, SudoMode};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const DEFAULT_LOG_FILES: [&str; 2] = ["/var/log/syslog", "/var/log/syslog.1"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Agent script pushed to every host; relative paths are taken from the config's directory.
    pub(crate) agent_script: PathBuf,
    #[serde(default)]
    pub(crate) defaults: Defaults,
    #[serde(default)]
    pub(crate) hosts: Vec<HostConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Defaults {
    pub(crate) log_files: Option<Vec<String>>,
    #[serde(default)]
    pub(crate) ssh_args: Vec<String>,
    pub(crate) ssh_password: Option<String>,
    #[serde(default)]
    pub(crate) sudo: bool,
    #[serde(default)]
    pub(crate) init_commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HostConfig {
    pub(crate) name: String,
    /// `[user@]host[:port]`; defaults to the name.
    pub(crate) ssh: Option<String>,
    pub(crate) jumphost: Option<String>,
    pub(crate) log_files: Option<Vec<String>>,
    pub(crate) sudo: Option<bool>,
    pub(crate) init_commands: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SshDestination {
    pub(crate) user: Option<String>,
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
}

pub(crate) fn parse_ssh_destination(raw: &str) -> Option<SshDestination> {
    let raw = raw.trim();
    if raw.is_empty() || raw.chars().any(char::is_whitespace) {
        return None;
    }
    let (user, rest) = match raw.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => return None,
        None => (None, raw),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
        None => (rest, None),
    };
    if host.is_empty() || host.contains(['@', ':', '/']) {
        return None;
    }
    Some(SshDestination {
        user,
        host: host.to_string(),
        port,
    })
}

fn log_files(files: &[String], label: &str) -> anyhow::Result<(String, String)> {
    match files {
        [last, prev] => Ok((last.clone(), prev.clone())),
        _ => anyhow::bail!("{label} log_files must list exactly two files (last, previous)"),
    }
}

fn validate_config(config: &Config) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    if let Some(files) = config.defaults.log_files.as_deref() {
        log_files(files, "defaults")?;
    }
    for (index, host) in config.hosts.iter().enumerate() {
        let name = host.name.trim();
        if name.is_empty() {
            anyhow::bail!("hosts[{index}] must set a name");
        }
        if !seen.insert(name) {
            anyhow::bail!("duplicate host name: {name}");
        }
        let ssh = host.ssh.as_deref().unwrap_or(name);
        if parse_ssh_destination(ssh).is_none() {
            anyhow::bail!("host {name} ssh must be [user@]host[:port]");
        }
        if let Some(files) = host.log_files.as_deref() {
            log_files(files, &format!("host {name}"))?;
        }
    }
    Ok(())
}

pub(crate) fn load_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    validate_config(&config)?;
    if config.agent_script.is_relative() {
        if let Some(dir) = path.parent() {
            config.agent_script = dir.join(&config.agent_script);
        }
    }
    Ok(config)
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Resolves host filters against the configured hosts.
#[derive(Debug)]
pub(crate) struct ConfigResolver {
    streams: Vec<LogStream>,
    defaults: Defaults,
}

impl ConfigResolver {
    pub(crate) fn new(config: Config) -> anyhow::Result<Self> {
        let mut streams = Vec::with_capacity(config.hosts.len());
        for host in &config.hosts {
            streams.push(configured_stream(host, &config.defaults)?);
        }
        Ok(Self {
            streams,
            defaults: config.defaults,
        })
    }

    fn resolve_item(&self, item: &str) -> anyhow::Result<Vec<LogStream>> {
        if let Some(stream) = self.streams.iter().find(|stream| stream.name == item) {
            return Ok(vec![stream.clone()]);
        }
        if item.contains(['*', '?', '[']) {
            let pattern = glob::Pattern::new(item)
                .with_context(|| format!("invalid host pattern {item}"))?;
            return Ok(self
                .streams
                .iter()
                .filter(|stream| pattern.matches(&stream.name))
                .cloned()
                .collect());
        }
        let destination = parse_ssh_destination(item)
            .with_context(|| format!("{item} is neither a configured host nor [user@]host[:port]"))?;
        ad_hoc_stream(item, destination, &self.defaults)
    }
}

#[async_trait]
impl HostResolver for ConfigResolver {
    async fn resolve(&self, filter: &str) -> anyhow::Result<Vec<LogStream>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for item in filter.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            for stream in self.resolve_item(item)? {
                if seen.insert(stream.name.clone()) {
                    resolved.push(stream);
                }
            }
        }
        Ok(resolved)
    }
}

fn shell_options(sudo: bool, init_commands: Vec<String>) -> ShellOptions {
    ShellOptions {
        sudo: if sudo {
            SudoMode::FullCommand
        } else {
            SudoMode::Disabled
        },
        init_commands,
    }
}

fn default_log_files(defaults: &Defaults) -> anyhow::Result<(String, String)> {
    match defaults.log_files.as_deref() {
        Some(files) => log_files(files, "defaults"),
        None => Ok((
            DEFAULT_LOG_FILES[0].to_string(),
            DEFAULT_LOG_FILES[1].to_string(),
        )),
    }
}

fn configured_stream(host: &HostConfig, defaults: &Defaults) -> anyhow::Result<LogStream> {
    let name = host.name.trim().to_string();
    let ssh = host.ssh.as_deref().unwrap_or(&name);
    let destination = parse_ssh_destination(ssh)
        .with_context(|| format!("host {name} ssh must be [user@]host[:port]"))?;
    let (logfile_last, logfile_prev) = match host.log_files.as_deref() {
        Some(files) => log_files(files, &format!("host {name}"))?,
        None => default_log_files(defaults)?,
    };
    Ok(LogStream {
        name,
        host: destination.host,
        port: destination.port,
        user: destination.user,
        jumphost: host.jumphost.clone(),
        logfile_last,
        logfile_prev,
        shell: shell_options(
            host.sudo.unwrap_or(defaults.sudo),
            host.init_commands
                .clone()
                .unwrap_or_else(|| defaults.init_commands.clone()),
        ),
    })
}

fn ad_hoc_stream(
    name: &str,
    destination: SshDestination,
    defaults: &Defaults,
) -> anyhow::Result<Vec<LogStream>> {
    let (logfile_last, logfile_prev) = default_log_files(defaults)?;
    Ok(vec![LogStream {
        name: name.to_string(),
        host: destination.host,
        port: destination.port,
        user: destination.user,
        jumphost: None,
        logfile_last,
        logfile_prev,
        shell: shell_options(defaults.sudo, defaults.init_commands.clone()),
    }])
}
