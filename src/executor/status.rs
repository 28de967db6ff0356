//! Poll-status classification

use tracing::warn;

/// What a remote status string means for the job's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Waiting to start on the remote side
    Pending,
    /// Actively generating
    Running,
    Completed,
    Failed,
}

/// Classify a remote status string.
///
/// Unrecognized statuses are treated as still running and logged: remote
/// services grow status vocabularies, and optimistic continuation lets the
/// poll budget decide rather than failing a live job.
pub fn classify(raw: &str, job_id: &str) -> PollStatus {
    match raw {
        "pending" | "queued" => PollStatus::Pending,
        "processing" | "running" => PollStatus::Running,
        "completed" | "done" | "success" => PollStatus::Completed,
        "failed" | "error" => PollStatus::Failed,
        other => {
            warn!(job_id, status = other, "Unrecognized remote status, continuing to poll");
            PollStatus::Running
        }
    }
}
