//! Daemon-side socket plumbing
//!
//! Creating and cleaning up the Unix domain socket, and the line-oriented
//! read/write helpers shared by the connection handler.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tracing::{debug, warn};

use super::IpcError;
use super::messages::{Request, Response};

/// Enqueue payloads carry whole job specs, so the cap is generous.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Create and bind the control socket, clearing any stale file from a
/// previous run.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf), IpcError> {
    debug!(?socket_path, "Binding control socket");
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        debug!(?socket_path, "Removing stale socket");
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown.
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists()
        && let Err(e) = std::fs::remove_file(socket_path)
    {
        warn!(?socket_path, error = %e, "Failed to remove socket file");
    }
}

/// Read one request line. `None` means the client closed the connection.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Request>, IpcError> {
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(IpcError::Protocol(format!("message too large: {} bytes", bytes_read)));
    }
    let request: Request = serde_json::from_str(line.trim())
        .map_err(|e| IpcError::Protocol(format!("unparseable request: {}", e)))?;
    debug!(?request, "Request received");
    Ok(Some(request))
}

/// Send one response line.
pub async fn send_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<(), IpcError> {
    let json = serde_json::to_string(response)
        .map_err(|e| IpcError::Protocol(format!("unserializable response: {}", e)))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
