//! JSON-RPC 2.0 client for MCP-style generation services
//!
//! Sessions are initialized lazily per endpoint; the server-assigned
//! `Mcp-Session-Id` is cached and echoed on subsequent calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RemoteService, ServiceError, StatusReport};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Key names remote services use for the external job id, in the order
/// they are probed.
const ID_KEYS: &[&str] = &[
    "request_id",
    "requestId",
    "session_id",
    "sessionId",
    "id",
    "job_id",
    "jobId",
];

pub struct RpcService {
    client: reqwest::Client,
    /// Endpoint -> negotiated session id
    sessions: Mutex<HashMap<String, String>>,
}

impl RpcService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize an MCP session for the endpoint if none is cached yet.
    async fn session_id(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(id) = sessions.get(endpoint) {
                return Ok(id.clone());
            }
        }

        let initial_id = uuid::Uuid::now_v7().to_string();
        let payload = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::now_v7().to_string(),
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "genqueue", "version": env!("CARGO_PKG_VERSION")},
            },
        });

        let mut request = self
            .client
            .post(endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("Mcp-Session-Id", &initial_id)
            .json(&payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(transport_error)?;
        let session_id = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(initial_id);
        let response = check_http_status(response)?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(format!("initialize response is not JSON: {}", e)))?;
        if let Some(error) = body.get("error") {
            return Err(ServiceError::Remote(error.to_string()));
        }

        debug!(endpoint, session_id, "MCP session initialized");
        self.sessions
            .lock()
            .await
            .insert(endpoint.to_string(), session_id.clone());
        Ok(session_id)
    }

    /// Invoke one tool via `tools/call` and return the JSON-RPC result.
    async fn call_tool(
        &self,
        endpoint: &str,
        tool: &str,
        arguments: Value,
        headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError> {
        let session_id = self.session_id(endpoint, headers).await?;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::now_v7().to_string(),
            "method": "tools/call",
            "params": {"name": tool, "arguments": arguments},
        });

        let mut request = self
            .client
            .post(endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("Mcp-Session-Id", &session_id)
            .json(&payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(transport_error)?;
        let response = check_http_status(response)?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Protocol(format!("response is not JSON: {}", e)))?;

        if let Some(error) = body.get("error") {
            return Err(ServiceError::Remote(error.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl Default for RpcService {
    fn default() -> Self {
        Self::new()
    }
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    ServiceError::Transient(e.to_string())
}

/// 429 and 5xx are transient; other error statuses are remote rejections.
fn check_http_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(ServiceError::Transient(format!("HTTP {}", status)))
    } else {
        Err(ServiceError::Remote(format!("HTTP {}", status)))
    }
}

/// Pull the external job id out of a submit response. Services disagree on
/// the key name, and some bury the id in a JSON string inside
/// `content[].text`.
pub fn extract_external_id(result: &Value) -> Option<String> {
    if let Some(obj) = result.as_object() {
        for key in ID_KEYS {
            if let Some(id) = obj.get(*key).and_then(Value::as_str)
                && !id.is_empty()
            {
                return Some(id.to_string());
            }
        }
        if let Some(items) = obj.get("content").and_then(Value::as_array) {
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str)
                    && let Ok(parsed) = serde_json::from_str::<Value>(text)
                    && let Some(id) = extract_external_id(&parsed)
                {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Pull the status string (and the most specific payload) out of a status
/// response, checking `status`/`state` keys at the top level and inside
/// `content[].text` JSON. The status comes back lowercased.
pub fn parse_status(result: &Value) -> (String, Value) {
    let top_status = result
        .get("status")
        .or_else(|| result.get("state"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(items) = result.get("content").and_then(Value::as_array) {
        for item in items {
            if let Some(text) = item.get("text").and_then(Value::as_str)
                && let Ok(parsed) = serde_json::from_str::<Value>(text)
            {
                let nested = parsed
                    .get("status")
                    .or_else(|| parsed.get("state"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(status) = nested.or(top_status.clone()) {
                    return (status.to_lowercase(), parsed);
                }
            }
        }
    }

    (
        top_status.unwrap_or_else(|| "unknown".to_string()).to_lowercase(),
        result.clone(),
    )
}

#[async_trait]
impl RemoteService for RpcService {
    async fn submit(
        &self,
        endpoint: &str,
        tool: &str,
        args: &Value,
        headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        let result = self.call_tool(endpoint, tool, args.clone(), headers).await?;
        extract_external_id(&result).ok_or_else(|| {
            ServiceError::Protocol(format!("no external job id in submit response: {}", result))
        })
    }

    async fn poll_status(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<StatusReport, ServiceError> {
        let result = self
            .call_tool(endpoint, tool, json!({ id_param: external_id }), headers)
            .await?;
        let (status, payload) = parse_status(&result);
        Ok(StatusReport { status, payload })
    }

    async fn fetch_result(
        &self,
        endpoint: &str,
        tool: &str,
        external_id: &str,
        id_param: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError> {
        self.call_tool(endpoint, tool, json!({ id_param: external_id }), headers)
            .await
    }
}
