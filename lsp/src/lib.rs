//! Protocol client core for an external language-analysis server.
//!
//! Spawns the server as a child process, frames JSON-RPC messages over its
//! stdio, correlates out-of-order responses back to their requests, and
//! delivers typed results on the caller's own execution context via a
//! [`Dispatcher`] supplied by the embedding shell.

mod codec;
mod connection;
mod pending;
mod protocol;
mod transport;

pub mod dispatch;
pub mod error;
pub mod types;

pub use connection::Connection;
pub use dispatch::{Dispatcher, InlineDispatcher};
pub use error::ClientError;
pub use protocol::RequestId;
pub use types::{
    ClientConfig, HoverFragment, HoverResult, LifecycleState, MarkupKind, ServerCapabilities,
};
