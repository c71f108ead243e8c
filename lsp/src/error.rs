//! Error taxonomy for the protocol client.
//!
//! Transport-level failures ([`ClientError::TransportWrite`],
//! [`ClientError::TransportRead`], [`ClientError::TransportClosed`]) are
//! fatal to the connection: they cancel every outstanding request and move
//! the lifecycle to `Stopped`. Message-level failures
//! ([`ClientError::MalformedFrame`], [`ClientError::Remote`]) are local to
//! one frame or one request and never tear the connection down.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server executable could not be resolved or started.
    #[error("failed to start language server `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    /// A caller-supplied path has no `file://` representation.
    #[error("cannot convert path to file URI: {}", .0.display())]
    InvalidPath(PathBuf),

    /// `start()` was called before a document root was set.
    #[error("document root not set")]
    NoDocumentRoot,

    /// A write to the server's stdin failed.
    #[error("transport write failed: {0}")]
    TransportWrite(String),

    /// A read from the server's stdout failed mid-stream.
    #[error("transport read failed: {0}")]
    TransportRead(String),

    /// The pipe to the server is gone (closed writer or end of stream).
    #[error("transport closed")]
    TransportClosed,

    /// One frame could not be decoded; the connection survives.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The connection was shut down while the request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered a request with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
}
