//! The shell session a client drives: one input sink and two independent output sources.

mod process;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::model::LogStream;

pub use process::ProcessConnector;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Notifications a connector may emit while a connection is being set up.
#[derive(Debug)]
pub enum ConnectProgress {
    Message(String),
    /// The connector needs a value from the user, e.g. a password.
    NeedData {
        title: String,
        reply: oneshot::Sender<String>,
    },
}

#[async_trait]
pub trait ShellCloser: Send {
    async fn close(self: Box<Self>);
}

pub struct ShellConnection {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub closer: Box<dyn ShellCloser>,
}

impl std::fmt::Debug for ShellConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellConnection").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ShellConnector: Send + Sync + 'static {
    /// Opens a shell for `stream`; progress is best-effort and may be ignored by the receiver.
    async fn connect(
        &self,
        stream: &LogStream,
        progress: mpsc::Sender<ConnectProgress>,
    ) -> anyhow::Result<ShellConnection>;
}
