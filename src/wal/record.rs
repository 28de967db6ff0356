//! WAL record framing
//!
//! One JSON object per line. Each record carries the post-transition job
//! snapshot, so replay is a plain insert-by-id and needs no event-specific
//! logic beyond checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobState};

/// Lifecycle events persisted to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WalEvent {
    /// A job was accepted into the queue
    Enqueued { job: Job },

    /// A job moved to a new non-terminal state
    StateChanged { job: Job },

    Completed { job: Job },

    Failed { job: Job },

    Cancelled { job: Job },

    /// Snapshot of all non-terminal jobs; starts a compacted log
    Checkpoint { jobs: Vec<Job> },
}

impl WalEvent {
    /// Build the event matching a job's post-transition state.
    pub fn for_transition(job: Job) -> Self {
        match job.state {
            JobState::Completed => Self::Completed { job },
            JobState::Failed => Self::Failed { job },
            JobState::Cancelled => Self::Cancelled { job },
            _ => Self::StateChanged { job },
        }
    }

    /// The job this event concerns, if any.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Enqueued { job }
            | Self::StateChanged { job }
            | Self::Completed { job }
            | Self::Failed { job }
            | Self::Cancelled { job } => Some(job),
            Self::Checkpoint { .. } => None,
        }
    }
}

/// One framed log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Monotonic, gapless sequence number
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: WalEvent,
}

impl WalRecord {
    pub fn new(seq: u64, event: WalEvent) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            event,
        }
    }
}
