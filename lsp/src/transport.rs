//! Child-process transport: owns the server process and its pipes.
//!
//! Purely byte-oriented — no protocol knowledge beyond handing frames to
//! the codec. Writes from any number of caller tasks funnel through one
//! writer task so frames are never interleaved mid-message; the reader
//! side is a single stdout handle consumed exclusively by the connection's
//! reader loop.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::FrameWriter;
use crate::error::ClientError;

const WRITER_CHANNEL_CAPACITY: usize = 64;

const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Cloneable handle for queueing outgoing frames.
#[derive(Clone)]
pub(crate) struct TransportWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl TransportWriter {
    /// Queue one frame for writing. Safe from any task; the writer task
    /// serializes the actual byte writes.
    pub async fn send(&self, frame: serde_json::Value) -> Result<(), ClientError> {
        self.tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ClientError::TransportClosed)
    }

    /// Non-awaiting variant for synchronous continuations. Fails if the
    /// queue is full or the writer is gone.
    pub fn send_now(&self, frame: serde_json::Value) -> Result<(), ClientError> {
        self.tx
            .try_send(WriterCommand::Send(frame))
            .map_err(|_| ClientError::TransportClosed)
    }

    async fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown).await;
    }

    /// Writer end backed by a bare channel, for tests that inspect queued
    /// frames instead of spawning a process.
    #[cfg(test)]
    pub fn test_pair() -> (Self, mpsc::Receiver<WriterCommand>) {
        let (tx, rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }
}

/// The spawned server process and its write channel.
///
/// Scoped resource: acquired by [`Transport::spawn`], released by
/// [`Transport::close`]. `kill_on_drop` guarantees the child is reaped on
/// every other exit path.
pub(crate) struct Transport {
    child: Child,
    command: String,
    writer: TransportWriter,
    #[allow(dead_code)]
    writer_handle: JoinHandle<()>,
}

impl Transport {
    /// Spawn the server executable with piped stdio.
    ///
    /// Fails with [`ClientError::Spawn`] if the executable cannot be
    /// resolved or started; no partial state survives a failure.
    ///
    /// The returned receiver fires with the error text if the writer task
    /// hits an I/O failure; it is dropped silently on a clean writer exit.
    pub async fn spawn(
        command: &str,
        args: &[String],
    ) -> Result<(Self, ChildStdout, oneshot::Receiver<String>), ClientError> {
        let spawn_error = |reason: String| ClientError::Spawn {
            command: command.to_string(),
            reason,
        };

        let resolved = which::which(command).map_err(|e| spawn_error(e.to_string()))?;
        let mut cmd = Command::new(&resolved);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(String::from("no stdout pipe")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(String::from("no stdin pipe")))?;

        let (tx, mut rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let (failure_tx, failure_rx) = oneshot::channel::<String>();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(command) = rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            let _ = failure_tx.send(e.to_string());
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        Ok((
            Self {
                child,
                command: command.to_string(),
                writer: TransportWriter { tx },
                writer_handle,
            },
            stdout,
            failure_rx,
        ))
    }

    pub fn writer(&self) -> TransportWriter {
        self.writer.clone()
    }

    /// Tear down the child: stop the writer task, wait briefly for a clean
    /// exit, then kill.
    pub async fn close(mut self) {
        self.writer.shutdown().await;
        if tokio::time::timeout(EXIT_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            tracing::debug!(command = %self.command, "server did not exit in time, killing");
            let _ = self.child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_missing_executable_fails() {
        let result = Transport::spawn("definitely-not-a-real-language-server", &[]).await;
        match result {
            Err(ClientError::Spawn { command, .. }) => {
                assert_eq!(command, "definitely-not-a-real-language-server");
            }
            Err(other) => panic!("expected Spawn error, got {other}"),
            Ok(_) => panic!("spawn of a missing executable must fail"),
        }
    }

    #[tokio::test]
    async fn spawn_missing_absolute_path_fails() {
        let result = Transport::spawn("/nonexistent/bin/clangd", &[]).await;
        assert!(matches!(result, Err(ClientError::Spawn { .. })));
    }

    #[tokio::test]
    async fn send_after_writer_gone_reports_closed() {
        let (writer, rx) = TransportWriter::test_pair();
        drop(rx);
        let err = writer.send(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::TransportClosed));
        assert!(matches!(
            writer.send_now(serde_json::json!({})),
            Err(ClientError::TransportClosed)
        ));
    }
}
