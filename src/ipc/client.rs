//! Control protocol client
//!
//! Used by the CLI to talk to a running daemon. A missing socket or a
//! refused connection is reported as [`IpcError::NotRunning`], which the
//! CLI maps to its own exit code.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::domain::{JobSpec, JobView, QueueSnapshot};

use super::IpcError;
use super::listener::MAX_MESSAGE_SIZE;
use super::messages::{ErrorKind, Request, Response};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one daemon control socket.
#[derive(Debug, Clone)]
pub struct QueueClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl QueueClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check the daemon is alive; returns its version.
    pub async fn ping(&self) -> Result<String, IpcError> {
        match self.request(Request::Ping).await? {
            Response::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Queue a job; returns the assigned job id once it is durably queued.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<String, IpcError> {
        match self.request(Request::Enqueue { spec }).await? {
            Response::Accepted { job_id } => Ok(job_id),
            other => Err(unexpected(other)),
        }
    }

    /// Snapshot the whole queue.
    pub async fn status(&self) -> Result<QueueSnapshot, IpcError> {
        match self.request(Request::Status { job_id: None }).await? {
            Response::Status { snapshot } => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    /// Snapshot one job.
    pub async fn job_status(&self, job_id: &str) -> Result<JobView, IpcError> {
        let request = Request::Status {
            job_id: Some(job_id.to_string()),
        };
        match self.request(request).await? {
            Response::Job { job } => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), IpcError> {
        let request = Request::Cancel {
            job_id: job_id.to_string(),
        };
        match self.request(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self, force: bool) -> Result<(), IpcError> {
        match self.request(Request::Shutdown { force }).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// One request/response round trip on a fresh connection.
    async fn request(&self, request: Request) -> Result<Response, IpcError> {
        if !self.socket_exists() {
            return Err(IpcError::NotRunning);
        }

        debug!(?self.socket_path, ?request, "Sending control request");
        let mut stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| IpcError::Timeout)?
            .map_err(|_| IpcError::NotRunning)?;

        let json =
            serde_json::to_string(&request).map_err(|e| IpcError::Protocol(format!("unserializable request: {}", e)))?;

        tokio::time::timeout(self.timeout, async {
            stream.write_all(json.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|_| IpcError::Timeout)??;

        let mut reader = BufReader::new(&mut stream);
        let mut line = String::new();
        let bytes_read = tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| IpcError::Timeout)??;
        if bytes_read == 0 {
            return Err(IpcError::Protocol("connection closed before response".to_string()));
        }
        if bytes_read > MAX_MESSAGE_SIZE {
            return Err(IpcError::Protocol(format!("response too large: {} bytes", bytes_read)));
        }

        let response: Response = serde_json::from_str(line.trim())
            .map_err(|e| IpcError::Protocol(format!("unparseable response: {}", e)))?;
        debug!(?response, "Control response received");

        if let Response::Error { kind, message } = response {
            return Err(match kind {
                ErrorKind::JobNotFound => IpcError::JobNotFound(message),
                _ => IpcError::Daemon(message),
            });
        }
        Ok(response)
    }
}

fn unexpected(response: Response) -> IpcError {
    IpcError::Protocol(format!("unexpected response: {:?}", response))
}
