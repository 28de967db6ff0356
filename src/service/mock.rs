//! Simulated endpoints for smoke tests
//!
//! Any job whose endpoint starts with `mock://` is served in-process: the
//! submit args decide how many polls it takes to complete, what the final
//! result payload looks like, and whether it fails instead. No network is
//! touched, which makes the full daemon path exercisable from tests and
//! the command line.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RemoteService, ServiceError, StatusReport};

#[derive(Debug, Clone)]
struct MockJob {
    remaining_polls: u32,
    fail_status: Option<String>,
    result: Value,
}

/// In-process stand-in for a remote generation service.
///
/// Recognized submit args:
/// - `polls`: status polls before the job reports completed (default 1)
/// - `fail_status`: report this status once the polls run out
/// - `result`: payload returned by the result tool (default `{}`)
pub struct MockService {
    jobs: Mutex<HashMap<String, MockJob>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for MockService {
    async fn submit(
        &self,
        endpoint: &str,
        _tool: &str,
        args: &Value,
        _headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        if let Some(reason) = args.get("submit_error").and_then(Value::as_str) {
            return Err(ServiceError::Remote(reason.to_string()));
        }

        let external_id = uuid::Uuid::now_v7().to_string();
        let job = MockJob {
            remaining_polls: args.get("polls").and_then(Value::as_u64).unwrap_or(1) as u32,
            fail_status: args.get("fail_status").and_then(Value::as_str).map(str::to_string),
            result: args.get("result").cloned().unwrap_or_else(|| json!({})),
        };
        debug!(endpoint, external_id, polls = job.remaining_polls, "Mock job submitted");
        self.jobs.lock().await.insert(external_id.clone(), job);
        Ok(external_id)
    }

    async fn poll_status(
        &self,
        _endpoint: &str,
        _tool: &str,
        external_id: &str,
        _id_param: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<StatusReport, ServiceError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(external_id)
            .ok_or_else(|| ServiceError::Protocol(format!("unknown mock job {}", external_id)))?;

        let status = if job.remaining_polls > 0 {
            job.remaining_polls -= 1;
            "processing".to_string()
        } else if let Some(fail_status) = &job.fail_status {
            fail_status.clone()
        } else {
            "completed".to_string()
        };

        Ok(StatusReport {
            status: status.clone(),
            payload: json!({"status": status, "mock": true}),
        })
    }

    async fn fetch_result(
        &self,
        _endpoint: &str,
        _tool: &str,
        external_id: &str,
        _id_param: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(external_id)
            .ok_or_else(|| ServiceError::Protocol(format!("unknown mock job {}", external_id)))?;
        Ok(job.result.clone())
    }
}
