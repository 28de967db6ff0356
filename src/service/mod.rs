//! Remote-service and download collaborators
//!
//! The daemon core treats these as black boxes behind trait seams: the
//! executor only sees external ids, status strings, result values, and
//! per-URL download outcomes. The shipped implementations speak JSON-RPC
//! 2.0 over HTTP; `mock://` endpoints are simulated in-process.

mod download;
mod mock;
mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use download::{DownloadError, Downloader, HttpDownloader};
pub use mock::MockService;
pub use rpc::RpcService;

/// Failures from the remote job service, classified for the executor.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Network-level trouble; retried within the remaining poll budget
    #[error("transient network error: {0}")]
    Transient(String),

    /// The remote reported a failure; the message passes through verbatim
    #[error("service reported failure: {0}")]
    Remote(String),

    /// Malformed remote response
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One status poll's answer: the raw status string plus the full payload
/// (which may itself carry download URLs).
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: String,
    pub payload: Value,
}

/// Remote job service following the submit -> poll -> result pattern.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Start a remote job; returns the external job id.
    async fn submit(
        &self,
        endpoint: &str,
        tool: &str,
        args: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError>;

    /// Ask the remote for the job's current status.
    async fn poll_status(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<StatusReport, ServiceError>;

    /// Fetch the final (arbitrarily nested) result value.
    async fn fetch_result(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError>;
}

/// Routes `mock://` endpoints to the in-process simulator and everything
/// else over HTTP.
pub struct ServiceRouter {
    rpc: Arc<RpcService>,
    mock: Arc<MockService>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self {
            rpc: Arc::new(RpcService::new()),
            mock: Arc::new(MockService::new()),
        }
    }

    fn route(&self, endpoint: &str) -> Arc<dyn RemoteService> {
        if endpoint.starts_with("mock://") {
            self.mock.clone()
        } else {
            self.rpc.clone()
        }
    }
}

impl Default for ServiceRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for ServiceRouter {
    async fn submit(
        &self,
        endpoint: &str,
        tool: &str,
        args: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        self.route(endpoint).submit(endpoint, tool, args, headers).await
    }

    async fn poll_status(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<StatusReport, ServiceError> {
        self.route(endpoint)
            .poll_status(endpoint, tool, external_id, id_param, headers)
            .await
    }

    async fn fetch_result(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError> {
        self.route(endpoint)
            .fetch_result(endpoint, tool, external_id, id_param, headers)
            .await
    }
}
