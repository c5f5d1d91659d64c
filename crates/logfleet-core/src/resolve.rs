use async_trait::async_trait;

use crate::model::LogStream;

/// Turns a host filter expression into the log streams it selects.
///
/// An empty result is not an error; the fleet reports it as "no matching hosts".
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    async fn resolve(&self, filter: &str) -> anyhow::Result<Vec<LogStream>>;
}

/// Resolves against a fixed list: `*` selects everything, otherwise a comma-separated list of names.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    streams: Vec<LogStream>,
}

impl StaticResolver {
    pub fn new(streams: Vec<LogStream>) -> Self {
        Self { streams }
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, filter: &str) -> anyhow::Result<Vec<LogStream>> {
        let names: Vec<&str> = filter
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        if names.contains(&"*") {
            return Ok(self.streams.clone());
        }
        Ok(self
            .streams
            .iter()
            .filter(|stream| names.contains(&stream.name.as_str()))
            .cloned()
            .collect())
    }
}
