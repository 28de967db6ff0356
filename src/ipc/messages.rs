//! Control protocol message types
//!
//! Each message is a single line of JSON followed by `\n`, tagged with a
//! `type` field.

use serde::{Deserialize, Serialize};

use crate::domain::{JobSpec, JobView, QueueSnapshot};

/// Commands from the client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Liveness check
    Ping,

    /// Validate and queue a new job
    Enqueue { spec: JobSpec },

    /// Inspect one job or the whole queue
    Status {
        #[serde(default)]
        job_id: Option<String>,
    },

    /// Cancel a queued job immediately, or flag an in-flight one
    Cancel { job_id: String },

    /// Stop the daemon; `force` skips the drain-and-checkpoint path
    Shutdown {
        #[serde(default)]
        force: bool,
    },
}

/// Error classification carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSpec,
    JobNotFound,
    ShuttingDown,
    Internal,
}

/// Responses from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    Pong { version: String },

    /// Enqueue acknowledged; the job is durably queued
    Accepted { job_id: String },

    /// Whole-queue snapshot
    Status { snapshot: QueueSnapshot },

    /// Single-job snapshot
    Job { job: JobView },

    Ok,

    Error { kind: ErrorKind, message: String },
}
