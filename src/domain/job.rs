//! Job lifecycle state and the in-memory job record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::spec::JobSpec;

/// Lifecycle states of a job.
///
/// `Queued -> Admitted -> Submitting -> Polling -> Downloading` and then one
/// of the terminal states. Cancellation is a flag on [`Job`], not a state;
/// it is observed cooperatively between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Admitted,
    Submitting,
    Polling,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states count against the concurrency cap.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Admitted | Self::Submitting | Self::Polling | Self::Downloading)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Admitted => "admitted",
            Self::Submitting => "submitting",
            Self::Polling => "polling",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one artifact download. Jobs track these individually so a
/// partial success is reported instead of collapsing into a total failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub url: String,
    pub saved_path: Option<String>,
    pub error: Option<String>,
}

/// One job owned by the daemon.
///
/// Mutated only by the admission scheduler and the job executor; every
/// mutation is appended to the WAL before it becomes visible here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id assigned at enqueue
    pub id: String,

    /// FIFO ordering key, assigned at enqueue
    pub queue_seq: u64,

    pub spec: JobSpec,

    pub state: JobState,

    /// Id assigned by the remote service once submit succeeds
    pub external_id: Option<String>,

    /// Status polls performed so far
    pub polls: u32,

    /// Times this job has been admitted (re-admission happens after recovery)
    pub attempts: u32,

    /// Cooperative cancellation flag, checked between steps
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error message, kept verbatim for Status inspection
    pub last_error: Option<String>,

    /// URLs extracted from the result, first-seen order, recorded with the
    /// move to Downloading so recovery can resume the download phase
    pub download_urls: Vec<String>,

    pub downloads: Vec<DownloadOutcome>,
}

impl Job {
    /// Create a fresh Queued job from a validated spec.
    pub fn new(spec: JobSpec, queue_seq: u64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            queue_seq,
            spec,
            state: JobState::Queued,
            external_id: None,
            polls: 0,
            attempts: 0,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            download_urls: Vec::new(),
            downloads: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Paths of artifacts that downloaded successfully.
    pub fn saved_paths(&self) -> Vec<String> {
        self.downloads.iter().filter_map(|d| d.saved_path.clone()).collect()
    }
}

/// Client-facing view of a job, returned by Status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: String,
    pub queue_seq: u64,
    pub state: JobState,
    pub endpoint: String,
    pub submit_tool: String,
    pub external_id: Option<String>,
    pub polls: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub saved_paths: Vec<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            queue_seq: job.queue_seq,
            state: job.state,
            endpoint: job.spec.endpoint.clone(),
            submit_tool: job.spec.submit_tool.clone(),
            external_id: job.external_id.clone(),
            polls: job.polls,
            attempts: job.attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            last_error: job.last_error.clone(),
            saved_paths: job.saved_paths(),
        }
    }
}

/// Aggregate queue state, returned by Status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub jobs: Vec<JobView>,
}
