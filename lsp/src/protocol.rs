//! JSON-RPC message model and LSP payload builders.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{HoverFragment, HoverResult, MarkupKind, ServerCapabilities};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for an unhandled method.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

/// Correlation id pairing a request with its response.
///
/// This client allocates monotonically increasing integers, but the wire
/// allows strings too, so both decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC error object from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One wire message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Value,
    },
    /// Error responses may carry a null id when the server could not read
    /// the request at all.
    Error {
        id: Option<RequestId>,
        error: RemoteError,
    },
}

impl Message {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request { id, method, params } => {
                let mut frame = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "method": method,
                });
                if let Some(params) = params {
                    frame["params"] = params.clone();
                }
                frame
            }
            Self::Notification { method, params } => {
                let mut frame = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": method,
                });
                if let Some(params) = params {
                    frame["params"] = params.clone();
                }
                frame
            }
            Self::Response { id, result } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            }),
            Self::Error { id, error } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "error": error,
            }),
        }
    }

    /// Classify a decoded frame. `None` means the frame fits no message
    /// kind and should be dropped by the caller.
    pub fn from_value(frame: &Value) -> Option<Self> {
        let id = match frame.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw.clone()).ok()?),
        };
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .map(String::from);

        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request {
                id,
                method,
                params: frame.get("params").cloned(),
            }),
            (None, Some(method)) => Some(Self::Notification {
                method,
                params: frame.get("params").cloned(),
            }),
            (id, None) => {
                if let Some(error) = frame.get("error") {
                    let error: RemoteError = serde_json::from_value(error.clone()).ok()?;
                    Some(Self::Error { id, error })
                } else if let Some(result) = frame.get("result") {
                    Some(Self::Response {
                        id: id?,
                        result: result.clone(),
                    })
                } else {
                    None
                }
            }
        }
    }
}

pub(crate) fn initialize_params(root_uri: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "hover": {
                    "contentFormat": ["plaintext", "markdown"]
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

/// didOpen params. Documents always open at version 1; this client does
/// not track later edits.
pub(crate) fn did_open_params(uri: &str, language_id: &str, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": 1,
            "text": text
        }
    })
}

/// Hover params with a zero-based position.
pub(crate) fn hover_params(uri: &str, line: u32, column: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": column }
    })
}

/// Whether a capability field is advertised. Servers use `true`, an
/// options object, or omit the field entirely.
fn advertised(capabilities: &Value, key: &str) -> bool {
    match capabilities.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

/// Extract the provider set from an initialize result.
pub(crate) fn capabilities_from_initialize(result: &Value) -> ServerCapabilities {
    let Some(caps) = result.get("capabilities") else {
        return ServerCapabilities::default();
    };
    ServerCapabilities {
        hover: advertised(caps, "hoverProvider"),
        text_document_sync: advertised(caps, "textDocumentSync"),
        completion: advertised(caps, "completionProvider"),
        document_highlight: advertised(caps, "documentHighlightProvider"),
        rename: advertised(caps, "renameProvider"),
    }
}

fn marked_fragment(value: &Value) -> Option<HoverFragment> {
    match value {
        Value::String(s) => Some(HoverFragment::PlainText(s.clone())),
        Value::Object(_) => {
            let language = value.get("language")?.as_str()?;
            let code = value.get("value")?.as_str()?;
            Some(HoverFragment::Code {
                language: language.to_string(),
                value: code.to_string(),
            })
        }
        _ => None,
    }
}

/// Decode a hover result payload.
///
/// The server may answer with `null`, a bare string, a language-tagged
/// fragment, a markup object, or an ordered array of marked strings. Empty
/// payloads of any shape collapse to [`HoverResult::None`].
pub(crate) fn hover_result_from_value(result: &Value) -> HoverResult {
    let Some(contents) = result.get("contents") else {
        return HoverResult::None;
    };
    match contents {
        Value::String(s) if s.is_empty() => HoverResult::None,
        Value::String(s) => HoverResult::PlainText(s.clone()),
        Value::Object(fields) => {
            if let (Some(kind), Some(value)) = (
                fields.get("kind").and_then(Value::as_str),
                fields.get("value").and_then(Value::as_str),
            ) {
                let kind = if kind == "plaintext" {
                    MarkupKind::PlainText
                } else {
                    MarkupKind::Markdown
                };
                HoverResult::Markup {
                    kind,
                    value: value.to_string(),
                }
            } else if let Some(HoverFragment::Code { language, value }) = marked_fragment(contents)
            {
                HoverResult::Code { language, value }
            } else {
                HoverResult::None
            }
        }
        Value::Array(items) => {
            let fragments: Vec<HoverFragment> = items.iter().filter_map(marked_fragment).collect();
            if fragments.is_empty() {
                HoverResult::None
            } else {
                HoverResult::Fragments(fragments)
            }
        }
        _ => HoverResult::None,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    pub path: PathBuf,
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
