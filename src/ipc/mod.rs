//! Local control protocol
//!
//! Newline-delimited JSON over a Unix domain socket. One request in flight
//! per connection; the daemon answers every request with exactly one
//! response.

mod client;
mod listener;
mod messages;
mod server;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use client::QueueClient;
pub use listener::{cleanup_socket, create_listener_at, read_request, send_response};
pub use messages::{ErrorKind, Request, Response};
pub use server::serve_connection;

/// Control socket location inside the runtime directory.
pub fn socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("genqueue.sock")
}

/// Client-side failures, mapped to distinct CLI exit codes.
#[derive(Debug, Error)]
pub enum IpcError {
    /// No daemon process is reachable at the socket
    #[error("daemon is not running")]
    NotRunning,

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("timed out waiting for the daemon")]
    Timeout,

    /// The daemon answered with an error
    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),
}
