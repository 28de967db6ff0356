//! Per-job execution state machine
//!
//! One executor drives one admitted job through submit -> poll -> result ->
//! download. Every transition is persisted write-ahead through the queue
//! core; network calls happen outside the core lock, so one job's blocked
//! poll never delays another job or the admission loop. Cancellation is
//! checked before each step and never interrupts an in-flight call.

mod status;
mod urls;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::domain::{DownloadOutcome, Job, JobState};
use crate::queue::{Collaborators, QueueCore, QueueError};
use crate::service::ServiceError;

pub use status::{PollStatus, classify};
pub use urls::extract_urls;

pub struct JobExecutor {
    core: Arc<QueueCore>,
    collab: Arc<Collaborators>,
}

impl JobExecutor {
    pub fn new(core: Arc<QueueCore>, collab: Arc<Collaborators>) -> Self {
        Self { core, collab }
    }

    /// Drive a job from its current state to a terminal state. Also the
    /// resume entry point: recovered `Polling`/`Downloading` jobs pick up
    /// at the matching step.
    pub async fn run(self, job: Job) {
        let job_id = job.id.clone();
        let result = match job.state {
            JobState::Admitted => self.submit_phase(job).await,
            JobState::Polling => self.poll_phase(job, Value::Null).await,
            JobState::Downloading => {
                let urls = job.download_urls.clone();
                self.download_phase(job, urls).await
            }
            other => {
                warn!(job_id = %job_id, state = %other, "Executor handed a job in an unexpected state");
                Ok(())
            }
        };

        if let Err(e) = result {
            // Durability failures abort the executor; the core has already
            // triggered the emergency shutdown.
            error!(job_id = %job_id, error = %e, "Executor aborted");
        }
    }

    async fn submit_phase(&self, job: Job) -> Result<(), QueueError> {
        if self.core.is_cancel_requested(&job.id).await {
            return self.finish_cancelled(&job.id).await;
        }

        if self
            .core
            .transition(&job.id, |j| j.state = JobState::Submitting)
            .await?
            .is_none()
        {
            return Ok(());
        }

        let spec = &job.spec;
        debug!(job_id = %job.id, endpoint = %spec.endpoint, tool = %spec.submit_tool, "Submitting");
        match self
            .collab
            .service
            .submit(&spec.endpoint, &spec.submit_tool, &spec.args, &spec.headers)
            .await
        {
            Ok(external_id) => {
                info!(job_id = %job.id, external_id = %external_id, "Submitted to remote service");
                let Some(job) = self
                    .core
                    .transition(&job.id, |j| {
                        j.external_id = Some(external_id.clone());
                        j.state = JobState::Polling;
                    })
                    .await?
                else {
                    return Ok(());
                };
                self.poll_phase(job, Value::Null).await
            }
            // Any submit error is terminal: without a confirmed external id
            // a retry could start a duplicate remote job
            Err(e) => self.finish_failed(&job.id, e.to_string(), Vec::new()).await,
        }
    }

    async fn poll_phase(&self, job: Job, mut last_payload: Value) -> Result<(), QueueError> {
        let spec = job.spec.clone();
        let external_id = match &job.external_id {
            Some(id) => id.clone(),
            None => {
                // Recovery never hands out Polling without an external id
                return self
                    .finish_failed(&job.id, "polling with no external job id".to_string(), Vec::new())
                    .await;
            }
        };
        let poll_interval = Duration::from_secs_f64(spec.poll_interval);
        let mut polls = job.polls;

        loop {
            if self.core.is_cancel_requested(&job.id).await {
                return self.finish_cancelled(&job.id).await;
            }
            if polls >= spec.max_polls {
                return self
                    .finish_failed(
                        &job.id,
                        format!("timed out after {} status polls", spec.max_polls),
                        Vec::new(),
                    )
                    .await;
            }

            polls = self.core.bump_polls(&job.id).await;
            let report = self
                .collab
                .service
                .poll_status(&spec.endpoint, &spec.status_tool, &external_id, &spec.id_param, &spec.headers)
                .await;

            match report {
                Ok(report) => {
                    debug!(job_id = %job.id, polls, status = %report.status, "Status poll");
                    match classify(&report.status, &job.id) {
                        PollStatus::Completed => {
                            last_payload = report.payload;
                            break;
                        }
                        PollStatus::Failed => {
                            return self
                                .finish_failed(
                                    &job.id,
                                    format!("remote status '{}': {}", report.status, report.payload),
                                    Vec::new(),
                                )
                                .await;
                        }
                        PollStatus::Pending | PollStatus::Running => {
                            last_payload = report.payload;
                        }
                    }
                }
                Err(ServiceError::Transient(e)) => {
                    // Retried within the remaining poll budget
                    warn!(job_id = %job.id, polls, error = %e, "Transient poll failure");
                }
                Err(e @ (ServiceError::Remote(_) | ServiceError::Protocol(_))) => {
                    return self.finish_failed(&job.id, e.to_string(), Vec::new()).await;
                }
            }

            tokio::time::sleep(poll_interval).await;
        }

        // Remote says completed: fetch the result and find the artifacts
        if self.core.is_cancel_requested(&job.id).await {
            return self.finish_cancelled(&job.id).await;
        }
        let result = self
            .collab
            .service
            .fetch_result(&spec.endpoint, &spec.result_tool, &external_id, &spec.id_param, &spec.headers)
            .await;
        let result = match result {
            Ok(value) => value,
            Err(e) => return self.finish_failed(&job.id, e.to_string(), Vec::new()).await,
        };

        let mut urls = extract_urls(&result);
        if urls.is_empty() {
            // Some services put the artifact links in the final status
            // payload instead of the result
            urls = extract_urls(&last_payload);
        }

        let Some(job) = self
            .core
            .transition(&job.id, |j| {
                j.state = JobState::Downloading;
                j.download_urls = urls.clone();
            })
            .await?
        else {
            return Ok(());
        };
        self.download_phase(job, urls).await
    }

    async fn download_phase(&self, job: Job, urls: Vec<String>) -> Result<(), QueueError> {
        let total = urls.len();
        let mut outcomes: Vec<DownloadOutcome> = Vec::with_capacity(total);

        for (index, url) in urls.iter().enumerate() {
            if self.core.is_cancel_requested(&job.id).await {
                return self.finish_cancelled(&job.id).await;
            }
            match self
                .collab
                .downloader
                .fetch(url, &job.spec.output, &job.id, index, total)
                .await
            {
                Ok(path) => {
                    info!(job_id = %job.id, url = %url, path = %path.display(), "Artifact downloaded");
                    outcomes.push(DownloadOutcome {
                        url: url.clone(),
                        saved_path: Some(path.display().to_string()),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(job_id = %job.id, url = %url, error = %e, "Artifact download failed");
                    outcomes.push(DownloadOutcome {
                        url: url.clone(),
                        saved_path: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.saved_path.is_some()).count();
        if total > 0 && succeeded == 0 {
            // Only a total download failure fails the job; partial success
            // is reported through the per-URL outcomes
            return self
                .finish_failed(&job.id, format!("all {} downloads failed", total), outcomes)
                .await;
        }

        self.core
            .transition(&job.id, |j| {
                j.state = JobState::Completed;
                j.completed_at = Some(chrono::Utc::now());
                j.downloads = outcomes.clone();
            })
            .await?;
        info!(job_id = %job.id, downloaded = succeeded, total, "Job completed");
        Ok(())
    }

    async fn finish_cancelled(&self, job_id: &str) -> Result<(), QueueError> {
        self.core
            .transition(job_id, |j| {
                j.state = JobState::Cancelled;
                j.completed_at = Some(chrono::Utc::now());
            })
            .await?;
        info!(job_id, "Job cancelled");
        Ok(())
    }

    async fn finish_failed(
        &self,
        job_id: &str,
        error: String,
        outcomes: Vec<DownloadOutcome>,
    ) -> Result<(), QueueError> {
        self.core
            .transition(job_id, |j| {
                j.state = JobState::Failed;
                j.completed_at = Some(chrono::Utc::now());
                j.last_error = Some(error.clone());
                if !outcomes.is_empty() {
                    j.downloads = outcomes.clone();
                }
            })
            .await?;
        info!(job_id, error = %error, "Job failed");
        Ok(())
    }
}
