//! Public types consumed by the editor shell.
//!
//! The shell constructs a [`ClientConfig`], drives a
//! [`Connection`](crate::Connection) through its lifecycle, and receives
//! [`HoverResult`]s in its callbacks. Nothing here interprets or renders
//! hover content; that is the caller's business.

use serde::Deserialize;

fn default_language_id() -> String {
    String::from("cpp")
}

/// Configuration for one language-server connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server executable, either an absolute path or a name resolved via
    /// `PATH` (e.g. "clangd").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier sent with opened documents.
    #[serde(default = "default_language_id")]
    pub language_id: String,
}

impl ClientConfig {
    /// Config with default arguments and language id.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            language_id: default_language_id(),
        }
    }
}

/// Connection lifecycle.
///
/// `start()` moves `Stopped → Starting → AwaitingInitializeResult`; the
/// reader loop moves to `Ready` when the initialize response arrives.
/// Every path out — graceful shutdown or transport failure — ends in
/// `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    AwaitingInitializeResult,
    Ready,
    ShuttingDown,
}

/// Format of a markup hover payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupKind {
    PlainText,
    Markdown,
}

/// One element of a multi-part hover answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoverFragment {
    PlainText(String),
    /// A code fragment tagged with its language (e.g. "cpp").
    Code {
        language: String,
        value: String,
    },
}

/// Decoded hover answer.
///
/// The wire format allows several shapes for the same logical field; each
/// gets its own variant so callers can match exhaustively. `None` doubles
/// as the "no result" marker: hover is advisory, so errors and empty
/// payloads both collapse into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoverResult {
    /// The server had nothing to say (or the request failed).
    None,
    PlainText(String),
    Markup { kind: MarkupKind, value: String },
    Code { language: String, value: String },
    Fragments(Vec<HoverFragment>),
}

impl HoverResult {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Capabilities the server advertised in its initialize response.
///
/// Informational only: no operation is gated on these. Absent capabilities
/// are logged once per session at initialize time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub hover: bool,
    pub text_document_sync: bool,
    pub completion: bool,
    pub document_highlight: bool,
    pub rename: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_from_json() {
        let config: ClientConfig =
            serde_json::from_value(serde_json::json!({ "command": "/usr/bin/clangd" })).unwrap();
        assert_eq!(config.command, "/usr/bin/clangd");
        assert!(config.args.is_empty());
        assert_eq!(config.language_id, "cpp");
    }

    #[test]
    fn config_explicit_fields() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "command": "pyright-langserver",
            "args": ["--stdio"],
            "language_id": "python"
        }))
        .unwrap();
        assert_eq!(config.args, vec!["--stdio"]);
        assert_eq!(config.language_id, "python");
    }

    #[test]
    fn hover_result_is_none() {
        assert!(HoverResult::None.is_none());
        assert!(!HoverResult::PlainText("int x".into()).is_none());
    }
}
