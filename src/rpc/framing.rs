//! Content-Length framing for JSON-RPC messages.
//!
//! Wire format per the LSP base protocol: `Content-Length: N\r\n\r\n{json}`.
//! Reading returns `Ok(None)` on a clean end-of-stream so the caller can
//! distinguish a dead worker from a malformed frame.

use std::io;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write one framed message and flush.
pub(crate) async fn write_message<W>(writer: &mut W, message: &Value) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(message)?;
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

/// Read one framed message. `Ok(None)` means end-of-stream.
pub(crate) async fn read_message<R>(reader: &mut R) -> io::Result<Option<Value>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            // EOF. Mid-header EOF still counts as stream closure.
            return Ok(None);
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(len) = line.strip_prefix("Content-Length:") {
            let len = len.trim().parse::<usize>().map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad Content-Length: {e}"))
            })?;
            content_length = Some(len);
        }
        // Other headers (Content-Type) are tolerated and skipped.
    }

    let content_length = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header")
    })?;

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let message = serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad JSON body: {e}")))?;
    Ok(Some(message))
}
