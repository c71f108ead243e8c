//! Connection: lifecycle state machine, reader loop, and the typed API.
//!
//! One `Connection` per editor session. It owns the transport, the pending
//! table, and the single reader task that is the sole consumer of the
//! server's stdout. Callers issue requests from wherever they like; replies
//! come back through the dispatcher of the issuing context.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameError, FrameReader};
use crate::dispatch::{Dispatcher, InlineDispatcher};
use crate::error::ClientError;
use crate::pending::{FailureFn, PendingTable, SuccessFn};
use crate::protocol::{self, Message, RemoteError, RequestId};
use crate::transport::{Transport, TransportWriter};
use crate::types::{ClientConfig, HoverResult, LifecycleState, ServerCapabilities};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Atomic lifecycle holder. Both a caller task (`shutdown`) and the reader
/// loop (transport failure) write it, so transitions go through
/// compare-and-swap.
struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    fn new() -> Self {
        Self(AtomicU8::new(encode_state(LifecycleState::Stopped)))
    }

    fn get(&self) -> LifecycleState {
        decode_state(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: LifecycleState) {
        self.0.store(encode_state(state), Ordering::SeqCst);
    }

    /// Move `from → to`; false if some other party got there first.
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(
                encode_state(from),
                encode_state(to),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

fn encode_state(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Stopped => 0,
        LifecycleState::Starting => 1,
        LifecycleState::AwaitingInitializeResult => 2,
        LifecycleState::Ready => 3,
        LifecycleState::ShuttingDown => 4,
    }
}

fn decode_state(raw: u8) -> LifecycleState {
    match raw {
        1 => LifecycleState::Starting,
        2 => LifecycleState::AwaitingInitializeResult,
        3 => LifecycleState::Ready,
        4 => LifecycleState::ShuttingDown,
        _ => LifecycleState::Stopped,
    }
}

type NotificationFn = Arc<dyn Fn(Option<serde_json::Value>) + Send + Sync>;

/// State shared between the connection handle and the reader task.
pub(crate) struct Shared {
    state: LifecycleCell,
    pending: PendingTable,
    handlers: Mutex<HashMap<String, NotificationFn>>,
    capabilities: OnceLock<ServerCapabilities>,
    dispatcher: Arc<dyn Dispatcher>,
}

/// Client connection to one language-analysis server.
///
/// Dropping a `Connection` without calling [`Connection::shutdown`] still
/// reaps the child process (kill-on-drop), but skips the graceful protocol
/// exit.
pub struct Connection {
    config: ClientConfig,
    document_root: Option<PathBuf>,
    shared: Arc<Shared>,
    transport: Option<Transport>,
    writer: Option<TransportWriter>,
    reader_handle: Option<JoinHandle<()>>,
}

impl Connection {
    /// A stopped connection. Nothing is spawned until [`Connection::start`].
    #[must_use]
    pub fn new(config: ClientConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            config,
            document_root: None,
            shared: Arc::new(Shared {
                state: LifecycleCell::new(),
                pending: PendingTable::new(),
                handlers: Mutex::new(HashMap::new()),
                capabilities: OnceLock::new(),
                dispatcher,
            }),
            transport: None,
            writer: None,
            reader_handle: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.shared.state.get()
    }

    /// Capabilities from the initialize response, once it has arrived.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.shared.capabilities.get().copied()
    }

    /// Set the project root used for the initialize handshake.
    ///
    /// Only meaningful before [`Connection::start`]; later calls are
    /// ignored with a warning.
    pub fn set_document_root(&mut self, path: impl Into<PathBuf>) {
        if self.shared.state.get() != LifecycleState::Stopped {
            tracing::warn!("document root change ignored: connection already started");
            return;
        }
        self.document_root = Some(path.into());
    }

    /// Register a handler for a server-initiated notification method
    /// (e.g. `textDocument/publishDiagnostics`). Unhandled methods are
    /// dropped with a log line. Handlers run through the connection's
    /// dispatcher.
    pub async fn on_notification<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<serde_json::Value>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .await
            .insert(method.into(), Arc::new(handler));
    }

    /// Spawn the server and issue the initialize handshake.
    ///
    /// Non-blocking: returns once initialize is handed to the transport.
    /// The `Ready` transition happens when the reader loop sees the
    /// initialize response. Calling `start` outside `Stopped` is a no-op.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if !self
            .shared
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            tracing::debug!(state = ?self.shared.state.get(), "start ignored");
            return Ok(());
        }

        let Some(root) = self.document_root.clone() else {
            self.shared.state.set(LifecycleState::Stopped);
            return Err(ClientError::NoDocumentRoot);
        };
        let root_uri = match protocol::path_to_file_uri(&root) {
            Ok(uri) => uri,
            Err(_) => {
                self.shared.state.set(LifecycleState::Stopped);
                return Err(ClientError::InvalidPath(root));
            }
        };

        let (transport, stdout, write_failure) =
            match Transport::spawn(&self.config.command, &self.config.args).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    tracing::warn!("failed to start language server: {e}");
                    self.shared.state.set(LifecycleState::Stopped);
                    return Err(e);
                }
            };
        let writer = transport.writer();

        self.shared
            .state
            .set(LifecycleState::AwaitingInitializeResult);
        let id = register_initialize(&self.shared, &writer).await;

        let request = Message::Request {
            id: id.clone(),
            method: String::from("initialize"),
            params: Some(protocol::initialize_params(root_uri.as_str())),
        };
        if let Err(e) = writer.send(request.to_value()).await {
            self.shared.pending.remove(&id).await;
            self.shared.state.set(LifecycleState::Stopped);
            return Err(e);
        }

        self.reader_handle = Some(tokio::spawn(read_loop(
            stdout,
            self.shared.clone(),
            writer.clone(),
        )));
        tokio::spawn(watch_writes(write_failure, self.shared.clone()));
        self.writer = Some(writer);
        self.transport = Some(transport);
        Ok(())
    }

    /// Announce a freshly opened document with its full text.
    ///
    /// Fire-and-forget: no acknowledgment is expected, and outside `Ready`
    /// the call silently drops (the shell treats this as best-effort).
    pub async fn open_document(&self, path: &Path, text: &str) {
        if self.shared.state.get() != LifecycleState::Ready {
            tracing::debug!(path = %path.display(), "open_document ignored: connection not ready");
            return;
        }
        let Some(writer) = &self.writer else { return };
        let uri = match protocol::path_to_file_uri(path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!("{e}");
                return;
            }
        };
        let notification = Message::Notification {
            method: String::from("textDocument/didOpen"),
            params: Some(protocol::did_open_params(
                uri.as_str(),
                &self.config.language_id,
                text,
            )),
        };
        if writer.send(notification.to_value()).await.is_err() {
            tracing::warn!(path = %path.display(), "didOpen could not be written");
            fail_connection(&self.shared).await;
        }
    }

    /// Request hover information at a zero-based line/column position.
    ///
    /// `on_result` is invoked exactly once, through the dispatcher, with
    /// the decoded answer — or [`HoverResult::None`] when the server has
    /// nothing, the request fails, or the connection is not ready. Hover
    /// is advisory: no error ever reaches the caller.
    pub async fn hover<F>(&self, path: &Path, line: u32, column: u32, on_result: F)
    where
        F: FnOnce(HoverResult) + Send + 'static,
    {
        let writer = match (&self.writer, self.shared.state.get()) {
            (Some(writer), LifecycleState::Ready) => writer,
            _ => {
                tracing::debug!(path = %path.display(), "hover while not ready");
                self.shared
                    .dispatcher
                    .dispatch(Box::new(move || on_result(HoverResult::None)));
                return;
            }
        };
        let uri = match protocol::path_to_file_uri(path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!("{e}");
                self.shared
                    .dispatcher
                    .dispatch(Box::new(move || on_result(HoverResult::None)));
                return;
            }
        };

        // One caller callback, two completion arms. The pending table
        // fires at most one of them, so the slot is taken exactly once.
        let slot = Arc::new(std::sync::Mutex::new(Some(on_result)));
        let success_slot = Arc::clone(&slot);
        let on_success: SuccessFn = Box::new(move |value| {
            if let Some(callback) = success_slot.lock().ok().and_then(|mut s| s.take()) {
                callback(protocol::hover_result_from_value(&value));
            }
        });
        let on_error: FailureFn = Box::new(move |error| {
            tracing::warn!("hover request failed: {error}");
            if let Some(callback) = slot.lock().ok().and_then(|mut s| s.take()) {
                callback(HoverResult::None);
            }
        });

        let id = self
            .shared
            .pending
            .register(self.shared.dispatcher.clone(), on_success, on_error)
            .await;
        let request = Message::Request {
            id: id.clone(),
            method: String::from("textDocument/hover"),
            params: Some(protocol::hover_params(uri.as_str(), line, column)),
        };
        // A failed handoff means the writer task is gone: connection-fatal.
        // fail_connection cancels this registration along with the rest.
        if writer.send(request.to_value()).await.is_err() {
            tracing::warn!(%id, "hover request could not be written");
            fail_connection(&self.shared).await;
        }
    }

    /// Tear the connection down: best-effort protocol exit, cancel every
    /// outstanding request, terminate the child, join the reader.
    ///
    /// Idempotent; after completion the state is `Stopped` and zero
    /// pending callbacks remain unresolved.
    pub async fn shutdown(&mut self) {
        let state = self.shared.state.get();
        if state == LifecycleState::Stopped && self.transport.is_none() && self.writer.is_none() {
            self.shared.pending.cancel_all().await;
            return;
        }
        self.shared.state.set(LifecycleState::ShuttingDown);

        if let Some(writer) = self.writer.take()
            && state == LifecycleState::Ready
        {
            self.graceful_exit(&writer).await;
        }
        self.shared.pending.cancel_all().await;

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.await;
        }
        self.shared.state.set(LifecycleState::Stopped);
        tracing::info!("language server connection stopped");
    }

    /// Protocol-polite teardown: `shutdown` request, then `exit`
    /// notification once the server acknowledges. Every step is
    /// best-effort with a short timeout.
    async fn graceful_exit(&self, writer: &TransportWriter) {
        let (tx, rx) = oneshot::channel::<()>();
        let id = self
            .shared
            .pending
            .register(
                Arc::new(InlineDispatcher),
                Box::new(move |_| {
                    let _ = tx.send(());
                }),
                Box::new(|_| {}),
            )
            .await;
        let request = Message::Request {
            id: id.clone(),
            method: String::from("shutdown"),
            params: None,
        };
        if writer.send(request.to_value()).await.is_err() {
            self.shared.pending.remove(&id).await;
            return;
        }
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, rx).await {
            Ok(Ok(())) => {
                let exit = Message::Notification {
                    method: String::from("exit"),
                    params: None,
                };
                let _ = writer.send(exit.to_value()).await;
            }
            Ok(Err(_)) | Err(_) => {
                tracing::debug!("no shutdown acknowledgment from server");
                self.shared.pending.remove(&id).await;
            }
        }
    }
}

/// Register the internal initialize request.
///
/// Its continuation runs inline on the reader task — the `Ready`
/// transition must not depend on the embedder's dispatcher being serviced.
pub(crate) async fn register_initialize(
    shared: &Arc<Shared>,
    writer: &TransportWriter,
) -> RequestId {
    let success_shared = shared.clone();
    let success_writer = writer.clone();
    let on_success: SuccessFn = Box::new(move |result| {
        finish_initialize(&success_shared, &success_writer, &result);
    });
    let error_shared = shared.clone();
    let on_error: FailureFn = Box::new(move |error| {
        tracing::warn!("initialize failed: {error}");
        error_shared.state.set(LifecycleState::Stopped);
    });
    shared
        .pending
        .register(Arc::new(InlineDispatcher), on_success, on_error)
        .await
}

fn finish_initialize(shared: &Shared, writer: &TransportWriter, result: &serde_json::Value) {
    let caps = protocol::capabilities_from_initialize(result);
    // Logged once per session; callers are not gated on any of these.
    if !caps.hover {
        tracing::info!("server does not advertise hover support");
    }
    if !caps.text_document_sync {
        tracing::info!("server does not advertise text document sync");
    }
    if !caps.completion {
        tracing::info!("server does not advertise completion support");
    }
    if !caps.document_highlight {
        tracing::info!("server does not advertise document highlight support");
    }
    if !caps.rename {
        tracing::info!("server does not advertise rename support");
    }
    let _ = shared.capabilities.set(caps);

    let notification = Message::Notification {
        method: String::from("initialized"),
        params: Some(serde_json::json!({})),
    };
    if let Err(e) = writer.send_now(notification.to_value()) {
        tracing::warn!("failed to send initialized notification: {e}");
    }

    if shared.state.transition(
        LifecycleState::AwaitingInitializeResult,
        LifecycleState::Ready,
    ) {
        tracing::info!("language server ready");
    }
}

/// The single long-lived reader: decodes frames off the server's stdout
/// and routes them until shutdown or a transport-fatal error.
pub(crate) async fn read_loop<R: AsyncRead + Unpin>(
    input: R,
    shared: Arc<Shared>,
    writer: TransportWriter,
) {
    let mut reader = FrameReader::new(input);
    loop {
        if shared.state.get() == LifecycleState::Stopped {
            break;
        }
        match reader.read_frame().await {
            Ok(Some(frame)) => dispatch_frame(&frame, &shared, &writer).await,
            Ok(None) => {
                if shared.state.get() == LifecycleState::ShuttingDown {
                    tracing::debug!("server closed stdout during shutdown");
                } else {
                    tracing::warn!("server closed stdout");
                }
                fail_connection(&shared).await;
                break;
            }
            Err(FrameError::Malformed(reason)) => {
                let error = ClientError::MalformedFrame(reason);
                tracing::warn!("dropping frame: {error}");
            }
            Err(FrameError::Io(e)) => {
                let error = ClientError::TransportRead(e.to_string());
                tracing::warn!("{error}");
                fail_connection(&shared).await;
                break;
            }
        }
    }
}

/// Companion to the reader loop for the write side: the writer task
/// reports an I/O failure at most once, and a failed write is fatal to the
/// whole connection, not just to the frame that hit it.
pub(crate) async fn watch_writes(failure: oneshot::Receiver<String>, shared: Arc<Shared>) {
    // Err means the writer task exited cleanly; nothing to do.
    if let Ok(reason) = failure.await {
        let error = ClientError::TransportWrite(reason);
        tracing::warn!("{error}");
        fail_connection(&shared).await;
    }
}

/// Transport-fatal path: stop the connection and fail every outstanding
/// request so no caller waits forever.
async fn fail_connection(shared: &Shared) {
    shared.state.set(LifecycleState::Stopped);
    shared.pending.cancel_all().await;
}

/// Route one decoded frame: responses to the pending table, notifications
/// to registered handlers, server requests to a method-not-found reply.
pub(crate) async fn dispatch_frame(
    frame: &serde_json::Value,
    shared: &Arc<Shared>,
    writer: &TransportWriter,
) {
    let Some(message) = Message::from_value(frame) else {
        tracing::warn!("dropping unrecognized frame");
        return;
    };

    match message {
        Message::Response { id, result } => {
            shared.pending.resolve(&id, result).await;
        }
        Message::Error {
            id: Some(id),
            error,
        } => {
            shared
                .pending
                .resolve_error(
                    &id,
                    ClientError::Remote {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    },
                )
                .await;
        }
        Message::Error { id: None, error } => {
            tracing::warn!(code = error.code, "server error without request id: {}", error.message);
        }
        Message::Request { id, method, .. } => {
            // Servers block waiting for replies to client/registerCapability
            // and friends; answer method-not-found rather than stalling them.
            tracing::debug!(%id, %method, "replying method-not-found to server request");
            let reply = Message::Error {
                id: Some(id),
                error: RemoteError {
                    code: protocol::METHOD_NOT_FOUND,
                    message: format!("method not found: {method}"),
                    data: None,
                },
            };
            if let Err(e) = writer.send(reply.to_value()).await {
                tracing::warn!("failed to answer server request: {e}");
            }
        }
        Message::Notification { method, params } => {
            let handler = shared.handlers.lock().await.get(&method).cloned();
            match handler {
                Some(handler) => shared
                    .dispatcher
                    .dispatch(Box::new(move || handler(params))),
                None => tracing::trace!(%method, "ignoring unhandled notification"),
            }
        }
    }
}
