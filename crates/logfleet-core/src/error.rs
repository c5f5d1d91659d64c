use thiserror::Error;

/// Reasons a query is refused before any host is contacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryRejected {
    #[error("no hosts match the current filter")]
    NoMatchingHosts,
    #[error("{0} host(s) are not connected yet")]
    NotConnected(usize),
    #[error("another query is already in flight")]
    Busy,
    #[error("the fleet has shut down")]
    Closed,
}
