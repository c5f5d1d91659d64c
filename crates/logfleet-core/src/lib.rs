//! Connection and query coordination for querying logs on many hosts over shell sessions.
//!
//! Each host is driven by a [`client::ClientHandle`] actor; a [`fleet::Fleet`] owns the set of
//! clients for the current host filter, fans queries out, and merges the replies.

pub mod client;
pub mod error;
pub mod fleet;
pub mod model;
pub mod resolve;
pub mod shell;
pub mod timefmt;

pub use client::ClientSettings;
pub use error::QueryRejected;
pub use fleet::{Fleet, FleetUpdate};
pub use model::*;
pub use resolve::{HostResolver, StaticResolver};
pub use shell::{ProcessConnector, ShellConnector};
