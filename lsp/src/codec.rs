//! JSON-RPC framing codec.
//!
//! Messages travel over the child's stdio as
//! `Content-Length: N\r\n\r\n{json}`. [`FrameReader`] and [`FrameWriter`]
//! handle the framing; they know byte counts and headers, not message
//! semantics.
//!
//! Decode failures come in two flavors and the reader loop treats them
//! differently: [`FrameError::Io`] means the stream itself failed (fatal to
//! the connection), [`FrameError::Malformed`] means one frame was garbage
//! while the stream stays usable (logged and dropped).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const DRAIN_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    /// The underlying stream failed; no further frames can be read.
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),
    /// One undecodable frame. The stream position is past the frame, so
    /// the next read can proceed.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Reads framed JSON messages from an async byte stream.
pub(crate) struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            // Drain the payload so the stream stays in sync, then report
            // the frame as droppable rather than killing the connection.
            self.drain(content_length).await?;
            return Err(FrameError::Malformed(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(FrameError::Malformed(format!(
                "frame body is not valid JSON: {e}"
            ))),
        }
    }

    /// Parse header lines until the empty separator line.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF before any
    /// header byte.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF is clean only at a frame boundary. Note that
                // `content_length == None` does not imply "no headers read"
                // (EOF after only a Content-Type line must be an error).
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while reading frame headers",
                )));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            // The protocol writes "Content-Length" but parse the key
            // case-insensitively for robustness.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    let len: usize = trimmed[colon_pos + 1..].trim().parse().map_err(|e| {
                        FrameError::Malformed(format!("invalid Content-Length value: {e}"))
                    })?;
                    content_length = Some(len);
                }
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(FrameError::Malformed(String::from(
                "missing Content-Length header",
            ))),
        }
    }

    /// Read and discard `remaining` payload bytes.
    async fn drain(&mut self, mut remaining: usize) -> Result<(), FrameError> {
        let mut chunk = vec![0u8; DRAIN_CHUNK_BYTES.min(remaining)];
        while remaining > 0 {
            let want = chunk.len().min(remaining);
            self.reader.read_exact(&mut chunk[..want]).await?;
            remaining -= want;
        }
        Ok(())
    }
}

/// Writes framed JSON messages to an async byte stream.
pub(crate) struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write it with a `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_string(msg)
            .map_err(|e| FrameError::Malformed(format!("unserializable frame: {e}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "textDocument/hover",
            "params": { "position": { "line": 10, "character": 4 } }
        });

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result, msg);
    }

    #[tokio::test]
    async fn multiple_frames() {
        let msg1 = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        let msg2 = serde_json::json!({"jsonrpc": "2.0", "id": 2});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg1).await.unwrap();
        writer.write_frame(&msg2).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg2);
    }

    #[tokio::test]
    async fn eof_at_boundary_returns_none() {
        let buf: &[u8] = b"";
        let mut reader = FrameReader::new(buf);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_content_length_is_malformed() {
        let buf: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn eof_mid_headers_is_io_error() {
        let buf: &[u8] = b"Content-Length: 10\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn oversized_frame_dropped_stream_stays_usable() {
        let oversized_len = MAX_FRAME_BYTES + 1;
        let mut buf = format!("Content-Length: {oversized_len}\r\n\r\n").into_bytes();
        buf.extend(std::iter::repeat_n(b'x', oversized_len));
        let follow_up = serde_json::json!({"jsonrpc": "2.0", "id": 7});
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&follow_up).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Malformed(_))
        ));
        // The oversized payload was drained; the next frame decodes.
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), follow_up);
    }

    #[tokio::test]
    async fn case_insensitive_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!("content-length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn ignores_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn eof_mid_body_is_io_error() {
        // Content-Length says 100, but only 5 bytes follow.
        let buf: &[u8] = b"Content-Length: 100\r\n\r\nhello";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(reader.read_frame().await, Err(FrameError::Io(_))));
    }

    #[tokio::test]
    async fn invalid_json_body_dropped_stream_stays_usable() {
        let body = b"not valid json!!!";
        let mut buf = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        buf.extend_from_slice(body);
        let follow_up = serde_json::json!({"jsonrpc": "2.0", "id": 3});
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&follow_up).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Malformed(_))
        ));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), follow_up);
    }

    #[tokio::test]
    async fn invalid_content_length_value_is_malformed() {
        let buf: &[u8] = b"Content-Length: not_a_number\r\n\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await,
            Err(FrameError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn content_length_counts_bytes_not_chars() {
        // "é" is 2 bytes in UTF-8.
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["k"], "é");
    }

    #[tokio::test]
    async fn write_content_length_is_byte_count() {
        let msg = serde_json::json!({"k": "é"});
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let output = String::from_utf8(buf).unwrap();
        let body = serde_json::to_string(&msg).unwrap();
        assert!(output.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
    }
}
