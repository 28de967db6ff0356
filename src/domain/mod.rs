//! Domain types: job specifications, jobs, and status snapshots

mod job;
mod spec;

pub use job::{DownloadOutcome, Job, JobState, JobView, QueueSnapshot};
pub use spec::{JobSpec, OutputRouting};
