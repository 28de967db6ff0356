//! Job specifications submitted by clients
//!
//! A [`JobSpec`] carries everything needed to drive one job through the
//! remote service's submit -> poll -> result cycle, plus the output routing
//! the downloader uses to place artifacts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigError;

/// Where downloaded artifacts should land.
///
/// The daemon passes this through to the downloader untouched; only per-URL
/// success/failure comes back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputRouting {
    /// Directory for downloads (defaults to `./output` in the downloader)
    pub output_dir: Option<String>,

    /// Explicit output file name; overwrites are allowed when set
    pub output_file: Option<String>,

    /// Use `{job_id}_{timestamp}{ext}` naming instead of URL-derived names
    pub auto_filename: bool,
}

fn default_id_param() -> String {
    "request_id".to_string()
}

fn default_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Specification of one asynchronous generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Remote service endpoint URL (`mock://` endpoints are simulated)
    pub endpoint: String,

    /// Tool that starts the remote job
    pub submit_tool: String,

    /// Tool polled for job status
    pub status_tool: String,

    /// Tool that returns the final result payload
    pub result_tool: String,

    /// Opaque arguments forwarded to the submit tool
    #[serde(default = "default_args")]
    pub args: Value,

    /// Extra HTTP headers (auth tokens etc.)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Parameter name the remote expects for the external job id
    #[serde(default = "default_id_param")]
    pub id_param: String,

    /// Seconds between status polls; zero means use the daemon default
    #[serde(default)]
    pub poll_interval: f64,

    /// Maximum poll attempts; zero derives from the configured job timeout
    #[serde(default)]
    pub max_polls: u32,

    /// Output routing for downloaded artifacts
    #[serde(default)]
    pub output: OutputRouting,
}

impl JobSpec {
    /// Reject specs that cannot possibly run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("job spec: endpoint is empty".into()));
        }
        for (name, value) in [
            ("submit-tool", &self.submit_tool),
            ("status-tool", &self.status_tool),
            ("result-tool", &self.result_tool),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("job spec: {} is empty", name)));
            }
        }
        if !self.poll_interval.is_finite() || self.poll_interval < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "job spec: poll-interval {} is not a non-negative number",
                self.poll_interval
            )));
        }
        Ok(())
    }

    /// Fill poll defaults from daemon configuration.
    ///
    /// Mirrors the submit path: a missing poll interval takes the daemon
    /// default, and a missing poll budget is derived from the job timeout.
    pub fn normalize(&mut self, default_poll_interval: f64, job_timeout: f64) {
        if self.poll_interval <= 0.0 {
            self.poll_interval = default_poll_interval;
        }
        if self.max_polls == 0 {
            let derived = if self.poll_interval > 0.0 {
                (job_timeout / self.poll_interval) as u32
            } else {
                300
            };
            self.max_polls = derived.max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "endpoint": "https://api.example.com/mcp",
            "submit_tool": "generate_image",
            "status_tool": "check_status",
            "result_tool": "get_result",
            "args": {"prompt": "a lighthouse"},
        }))
        .unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let spec = spec();
        assert_eq!(spec.id_param, "request_id");
        assert_eq!(spec.poll_interval, 0.0);
        assert_eq!(spec.max_polls, 0);
        assert!(spec.headers.is_empty());
        assert_eq!(spec.output, OutputRouting::default());
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let mut spec = spec();
        spec.endpoint = "  ".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_tool() {
        let mut spec = spec();
        spec.status_tool = String::new();
        let err = spec.validate().unwrap_err().to_string();
        assert!(err.contains("status-tool"));
    }

    #[test]
    fn test_normalize_fills_poll_defaults() {
        let mut spec = spec();
        spec.normalize(30.0, 900.0);
        assert_eq!(spec.poll_interval, 30.0);
        assert_eq!(spec.max_polls, 30);
    }

    #[test]
    fn test_normalize_keeps_explicit_values() {
        let mut spec = spec();
        spec.poll_interval = 5.0;
        spec.max_polls = 12;
        spec.normalize(30.0, 900.0);
        assert_eq!(spec.poll_interval, 5.0);
        assert_eq!(spec.max_polls, 12);
    }

    #[test]
    fn test_normalize_never_yields_zero_budget() {
        let mut spec = spec();
        spec.poll_interval = 600.0;
        spec.normalize(30.0, 60.0);
        assert_eq!(spec.max_polls, 1);
    }
}
