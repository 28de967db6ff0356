//! Rebuilding the job table from replayed WAL records

use std::collections::HashMap;

use tracing::{debug, info};

use crate::domain::{Job, JobState};

use super::record::{WalEvent, WalRecord};

/// Result of replaying the log at startup.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// Job table as it stood before the crash, after safety fix-ups
    pub jobs: HashMap<String, Job>,

    /// Next FIFO ordering key to hand out
    pub next_queue_seq: u64,

    /// Jobs reset from a pre-submit state back to Queued
    pub reset_to_queued: usize,

    /// Jobs that resume mid-flight with their external id
    pub resumed: usize,
}

/// Pure replay: apply records in order, last write per job wins. A
/// `Checkpoint` record resets the table to its snapshot. Replaying the same
/// records twice always yields the same table.
pub fn rebuild_table(records: &[WalRecord]) -> HashMap<String, Job> {
    let mut jobs: HashMap<String, Job> = HashMap::new();
    for record in records {
        match &record.event {
            WalEvent::Checkpoint { jobs: snapshot } => {
                jobs = snapshot.iter().map(|j| (j.id.clone(), j.clone())).collect();
            }
            other => {
                if let Some(job) = other.job() {
                    jobs.insert(job.id.clone(), job.clone());
                }
            }
        }
    }
    jobs
}

/// Replay plus the safety fix-ups that make resumption correct:
///
/// - `Admitted`/`Submitting` with no recorded external id go back to
///   `Queued`: no remote side effect was confirmed, so resubmission is
///   safe.
/// - `Polling`/`Downloading` with an external id stay put and resume from
///   that step, avoiding a duplicate submission.
pub fn recover(records: &[WalRecord]) -> RecoveredState {
    let mut state = RecoveredState {
        jobs: rebuild_table(records),
        ..Default::default()
    };

    for job in state.jobs.values_mut() {
        match job.state {
            JobState::Admitted | JobState::Submitting if job.external_id.is_none() => {
                debug!(job_id = %job.id, from = %job.state, "Recovery: resetting to queued");
                job.state = JobState::Queued;
                state.reset_to_queued += 1;
            }
            JobState::Polling | JobState::Downloading => {
                debug!(job_id = %job.id, state = %job.state, external_id = ?job.external_id,
                    "Recovery: resuming in-flight job");
                state.resumed += 1;
            }
            _ => {}
        }
    }

    state.next_queue_seq = state.jobs.values().map(|j| j.queue_seq).max().map_or(1, |s| s + 1);

    if !state.jobs.is_empty() {
        info!(
            jobs = state.jobs.len(),
            reset_to_queued = state.reset_to_queued,
            resumed = state.resumed,
            "Recovered job table from WAL"
        );
    }
    state
}
