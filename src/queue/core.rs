//! The daemon's owned state and admission decisions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, error, info};

use crate::config::QueueConfig;
use crate::domain::{Job, JobSpec, JobState, JobView, QueueSnapshot};
use crate::limiter::LimiterSet;
use crate::wal::{RecoveredState, WalError, WalEvent, WalStore};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("queue is shutting down")]
    ShuttingDown,

    /// WAL write failure. Fatal: nothing further can be made durable.
    #[error("durability failure: {0}")]
    Durability(#[from] WalError),
}

/// How the daemon should come down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownSignal {
    #[default]
    None,
    /// Stop admitting, drain within the grace period, checkpoint, exit
    Graceful,
    /// Exit now; WAL recovery picks up on the next start
    Immediate,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still Queued and is now Cancelled
    Removed,
    /// The job is in flight; the flag will be observed before its next step
    Flagged,
    /// The job had already finished
    AlreadyTerminal(JobState),
}

struct CoreInner {
    wal: WalStore,
    jobs: HashMap<String, Job>,
    limiters: LimiterSet,
    next_queue_seq: u64,
    last_admission: Option<Instant>,
    /// Cleared on shutdown or after a durability failure
    admitting: bool,
}

impl CoreInner {
    fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| j.is_active()).count()
    }

    fn non_terminal_jobs(&self) -> Vec<Job> {
        self.jobs.values().filter(|j| !j.is_terminal()).cloned().collect()
    }
}

/// Owned daemon state: job table, WAL handle, limiter buckets, and the
/// sequence counter, all behind one lock. Enqueue, admission, and every
/// executor transition run through here, write-ahead: the WAL record is
/// synced before the table changes.
pub struct QueueCore {
    config: QueueConfig,
    inner: Mutex<CoreInner>,
    notify: Notify,
    shutdown_tx: watch::Sender<ShutdownSignal>,
}

impl QueueCore {
    pub fn new(config: QueueConfig, wal: WalStore, recovered: RecoveredState) -> Arc<Self> {
        let limiters = LimiterSet::from_config(&config);
        let (shutdown_tx, _) = watch::channel(ShutdownSignal::None);
        Arc::new(Self {
            config,
            inner: Mutex::new(CoreInner {
                wal,
                jobs: recovered.jobs,
                limiters,
                next_queue_seq: recovered.next_queue_seq,
                last_admission: None,
                admitting: true,
            }),
            notify: Notify::new(),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Watch for shutdown requests (IPC, signals, or durability failures).
    pub fn subscribe_shutdown(&self) -> watch::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Wait until something changes admission eligibility.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Validate, normalize, persist, and insert a new job as Queued.
    /// The WAL record is synced before the job becomes visible.
    pub async fn enqueue(&self, mut spec: JobSpec) -> Result<Job, QueueError> {
        spec.validate().map_err(|e| QueueError::InvalidSpec(e.to_string()))?;
        spec.normalize(self.config.poll_interval, self.config.job_timeout);

        let mut inner = self.inner.lock().await;
        if !inner.admitting {
            return Err(QueueError::ShuttingDown);
        }

        let job = Job::new(spec, inner.next_queue_seq);
        if let Err(e) = inner.wal.append(WalEvent::Enqueued { job: job.clone() }) {
            self.fatal(&mut inner, &e);
            return Err(e.into());
        }
        inner.next_queue_seq += 1;
        inner.jobs.insert(job.id.clone(), job.clone());
        drop(inner);

        info!(job_id = %job.id, endpoint = %job.spec.endpoint, queue_seq = job.queue_seq, "Job enqueued");
        self.notify.notify_waiters();
        Ok(job)
    }

    /// Admit every currently eligible job, in enqueue order, and return the
    /// admitted jobs for executor spawning.
    ///
    /// Eligibility at `now`: a free concurrency slot, `start_interval`
    /// elapsed since the previous admission, and both the global and the
    /// endpoint bucket allowing. A job blocked only by its endpoint bucket
    /// is skipped so later jobs on other endpoints are not stalled behind
    /// it; a blocked global bucket stops the scan outright.
    pub async fn poll_admissions(&self, now: Instant) -> Result<Vec<Job>, QueueError> {
        let mut inner = self.inner.lock().await;
        if !inner.admitting {
            return Ok(Vec::new());
        }

        let start_interval = Duration::from_secs_f64(self.config.start_interval);
        let mut admitted = Vec::new();

        'admit: while inner.active_count() < self.config.max_concurrent as usize {
            if let Some(last) = inner.last_admission
                && now.saturating_duration_since(last) < start_interval
            {
                break;
            }

            let mut queued: Vec<(u64, String)> = inner
                .jobs
                .values()
                .filter(|j| j.state == JobState::Queued)
                .map(|j| (j.queue_seq, j.id.clone()))
                .collect();
            queued.sort_unstable();

            for (_, job_id) in queued {
                if inner.limiters.global_blocked_at(now) {
                    debug!("Global rate limit exhausted, pausing admissions");
                    break 'admit;
                }
                let endpoint = inner.jobs[&job_id].spec.endpoint.clone();
                if !inner.limiters.admit_at(&endpoint, now) {
                    // Endpoint-scoped exhaustion: scan past this job
                    debug!(job_id = %job_id, endpoint = %endpoint, "Endpoint rate limited, scanning forward");
                    continue;
                }

                let mut job = inner.jobs[&job_id].clone();
                job.state = JobState::Admitted;
                job.attempts += 1;
                job.started_at = Some(chrono::Utc::now());
                if let Err(e) = inner.wal.append(WalEvent::StateChanged { job: job.clone() }) {
                    self.fatal(&mut inner, &e);
                    return Err(e.into());
                }
                inner.jobs.insert(job_id.clone(), job.clone());
                inner.last_admission = Some(now);
                debug!(job_id = %job_id, attempts = job.attempts, "Job admitted");
                admitted.push(job);
                continue 'admit;
            }

            // Nothing admissible on this scan
            break;
        }

        Ok(admitted)
    }

    /// Apply a mutation to a job, write-ahead. The updated job is appended
    /// to the WAL (and synced) before it replaces the table entry. Returns
    /// the updated job, or `None` when the job is gone or already terminal.
    pub async fn transition<F>(&self, job_id: &str, mutate: F) -> Result<Option<Job>, QueueError>
    where
        F: FnOnce(&mut Job),
    {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.jobs.get(job_id) else {
            return Ok(None);
        };
        if current.is_terminal() {
            return Ok(None);
        }

        let mut job = current.clone();
        mutate(&mut job);

        if let Err(e) = inner.wal.append(WalEvent::for_transition(job.clone())) {
            self.fatal(&mut inner, &e);
            return Err(e.into());
        }
        inner.jobs.insert(job_id.to_string(), job.clone());

        if job.is_terminal() {
            debug!(job_id, state = %job.state, "Job reached terminal state");
            self.maybe_checkpoint(&mut inner);
            drop(inner);
            // A slot freed up; wake the admission loop
            self.notify.notify_waiters();
        }

        Ok(Some(job))
    }

    /// Count one status poll. Deliberately not written to the WAL: the poll
    /// budget is a liveness bound, and a recovered job restarts it.
    pub async fn bump_polls(&self, job_id: &str) -> u32 {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.polls += 1;
                job.polls
            }
            None => 0,
        }
    }

    /// Whether the job has been asked to stop. Checked by the executor
    /// before each step, never during one.
    pub async fn is_cancel_requested(&self, job_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).map(|j| j.cancel_requested).unwrap_or(false)
    }

    /// Cancel a job: a Queued job is cancelled on the spot, an in-flight
    /// job gets the cooperative flag.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.jobs.get(job_id) else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };
        if current.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(current.state));
        }

        let mut job = current.clone();
        job.cancel_requested = true;
        let outcome = if job.state == JobState::Queued {
            job.state = JobState::Cancelled;
            job.completed_at = Some(chrono::Utc::now());
            CancelOutcome::Removed
        } else {
            CancelOutcome::Flagged
        };

        if let Err(e) = inner.wal.append(WalEvent::for_transition(job.clone())) {
            self.fatal(&mut inner, &e);
            return Err(e.into());
        }
        inner.jobs.insert(job_id.to_string(), job);
        drop(inner);

        info!(job_id, ?outcome, "Cancel requested");
        self.notify.notify_waiters();
        Ok(outcome)
    }

    /// Jobs recovered mid-flight that need an executor again.
    pub async fn resumable_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Polling | JobState::Downloading))
            .cloned()
            .collect()
    }

    /// Current state of one job.
    pub async fn job_view(&self, job_id: &str) -> Option<JobView> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).map(JobView::from)
    }

    /// Aggregate queue snapshot for Status, jobs in enqueue order.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<&Job> = inner.jobs.values().collect();
        jobs.sort_unstable_by_key(|j| j.queue_seq);

        let mut snapshot = QueueSnapshot::default();
        for job in jobs {
            match job.state {
                JobState::Queued => snapshot.queued += 1,
                JobState::Completed => snapshot.completed += 1,
                JobState::Failed => snapshot.failed += 1,
                JobState::Cancelled => snapshot.cancelled += 1,
                _ => snapshot.running += 1,
            }
            snapshot.jobs.push(JobView::from(job));
        }
        snapshot
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count()
    }

    /// Stop admissions and broadcast the shutdown signal.
    pub async fn begin_shutdown(&self, signal: ShutdownSignal) {
        let mut inner = self.inner.lock().await;
        inner.admitting = false;
        drop(inner);
        let _ = self.shutdown_tx.send(signal);
        self.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        !self.inner.lock().await.admitting
    }

    /// Wait for in-flight jobs to reach a terminal state, bounded by the
    /// grace period. Returns whether the queue fully drained.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.active_count().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Snapshot non-terminal jobs and truncate the log.
    pub async fn checkpoint(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let jobs = inner.non_terminal_jobs();
        inner.wal.checkpoint(jobs)?;
        info!("WAL checkpoint written");
        Ok(())
    }

    fn maybe_checkpoint(&self, inner: &mut CoreInner) {
        if !inner.wal.should_checkpoint(self.config.wal_checkpoint_bytes) {
            return;
        }
        let jobs = inner.non_terminal_jobs();
        match inner.wal.checkpoint(jobs) {
            Ok(()) => info!("WAL checkpoint written (size threshold)"),
            Err(e) => self.fatal(inner, &e),
        }
    }

    /// A WAL write failed: no further progress can be made durable, so the
    /// whole daemon comes down. Admissions stop immediately.
    fn fatal(&self, inner: &mut CoreInner, e: &WalError) {
        error!(error = %e, "WAL write failed; triggering emergency shutdown");
        inner.admitting = false;
        let _ = self.shutdown_tx.send(ShutdownSignal::Immediate);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointRate;
    use crate::wal::recover;
    use tempfile::TempDir;

    fn test_config() -> QueueConfig {
        QueueConfig {
            max_concurrent: 2,
            start_interval: 0.0,
            global_rate_per_min: 0.0,
            global_burst: 0,
            ..Default::default()
        }
    }

    async fn core_with(config: QueueConfig, temp: &TempDir) -> Arc<QueueCore> {
        let (wal, records) = WalStore::open(temp.path().join("queue.wal")).unwrap();
        let recovered = recover(&records);
        QueueCore::new(config, wal, recovered)
    }

    fn spec_for(endpoint: &str) -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "endpoint": endpoint,
            "submit_tool": "generate",
            "status_tool": "status",
            "result_tool": "result",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_fifo_seqs() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;

        let j1 = core.enqueue(spec_for("mock://a")).await.unwrap();
        let j2 = core.enqueue(spec_for("mock://a")).await.unwrap();
        assert!(j2.queue_seq > j1.queue_seq);
        assert_eq!(j1.state, JobState::Queued);

        let snapshot = core.snapshot().await;
        assert_eq!(snapshot.queued, 2);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_spec() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;
        let mut spec = spec_for("mock://a");
        spec.submit_tool = String::new();
        assert!(matches!(
            core.enqueue(spec).await,
            Err(QueueError::InvalidSpec(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_fifo() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;

        let j1 = core.enqueue(spec_for("mock://a")).await.unwrap();
        let j2 = core.enqueue(spec_for("mock://a")).await.unwrap();
        let j3 = core.enqueue(spec_for("mock://a")).await.unwrap();

        let now = Instant::now();
        let admitted = core.poll_admissions(now).await.unwrap();
        let ids: Vec<_> = admitted.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids, vec![j1.id.clone(), j2.id.clone()]);

        // Cap reached; J3 stays queued
        assert!(core.poll_admissions(now).await.unwrap().is_empty());
        assert_eq!(core.active_count().await, 2);

        // A terminal transition frees the slot and J3 goes next
        core.transition(&j1.id, |j| j.state = JobState::Completed)
            .await
            .unwrap();
        let admitted = core.poll_admissions(now).await.unwrap();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, j3.id);
    }

    #[tokio::test]
    async fn test_start_interval_spacing() {
        let temp = TempDir::new().unwrap();
        let config = QueueConfig {
            max_concurrent: 10,
            start_interval: 5.0,
            global_rate_per_min: 0.0,
            global_burst: 0,
            ..Default::default()
        };
        let core = core_with(config, &temp).await;

        core.enqueue(spec_for("mock://a")).await.unwrap();
        core.enqueue(spec_for("mock://a")).await.unwrap();

        let t0 = Instant::now();
        assert_eq!(core.poll_admissions(t0).await.unwrap().len(), 1);
        // Too soon for the second admission
        assert!(core.poll_admissions(t0 + Duration::from_secs(1)).await.unwrap().is_empty());
        // Interval elapsed
        assert_eq!(
            core.poll_admissions(t0 + Duration::from_secs(5)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_endpoint_exhaustion_does_not_block_other_endpoints() {
        let temp = TempDir::new().unwrap();
        let mut config = QueueConfig {
            max_concurrent: 10,
            start_interval: 0.0,
            global_rate_per_min: 0.0,
            global_burst: 0,
            ..Default::default()
        };
        config.endpoint_rates.insert(
            "https://a.example.com".to_string(),
            EndpointRate {
                rate_per_min: 60.0,
                burst: 1,
            },
        );
        let core = core_with(config, &temp).await;

        let a1 = core.enqueue(spec_for("https://a.example.com")).await.unwrap();
        let a2 = core.enqueue(spec_for("https://a.example.com")).await.unwrap();
        let b1 = core.enqueue(spec_for("https://b.example.com")).await.unwrap();

        let now = Instant::now();
        let admitted = core.poll_admissions(now).await.unwrap();
        let ids: Vec<_> = admitted.iter().map(|j| j.id.clone()).collect();
        // a1 takes endpoint A's only token; a2 is endpoint-blocked but b1
        // must not wait behind it
        assert_eq!(ids, vec![a1.id.clone(), b1.id.clone()]);

        let snapshot = core.snapshot().await;
        let a2_view = snapshot.jobs.iter().find(|j| j.id == a2.id).unwrap();
        assert_eq!(a2_view.state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_global_exhaustion_blocks_everything() {
        let temp = TempDir::new().unwrap();
        let config = QueueConfig {
            max_concurrent: 10,
            start_interval: 0.0,
            global_rate_per_min: 60.0,
            global_burst: 1,
            ..Default::default()
        };
        let core = core_with(config, &temp).await;

        core.enqueue(spec_for("https://a.example.com")).await.unwrap();
        core.enqueue(spec_for("https://b.example.com")).await.unwrap();

        let now = Instant::now();
        assert_eq!(core.poll_admissions(now).await.unwrap().len(), 1);
        assert!(core.poll_admissions(now).await.unwrap().is_empty());
        // One token refills after a second
        assert_eq!(
            core.poll_admissions(now + Duration::from_secs(1)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_removes_before_admission() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;

        let job = core.enqueue(spec_for("mock://a")).await.unwrap();
        let outcome = core.cancel(&job.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Removed);

        assert!(core.poll_admissions(Instant::now()).await.unwrap().is_empty());
        let view = core.job_view(&job.id).await.unwrap();
        assert_eq!(view.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_sets_flag() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;

        let job = core.enqueue(spec_for("mock://a")).await.unwrap();
        core.poll_admissions(Instant::now()).await.unwrap();

        let outcome = core.cancel(&job.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Flagged);
        assert!(core.is_cancel_requested(&job.id).await);

        let view = core.job_view(&job.id).await.unwrap();
        assert_eq!(view.state, JobState::Admitted);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;
        assert!(matches!(
            core.cancel("no-such-job").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_on_terminal_job_is_noop() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;
        let job = core.enqueue(spec_for("mock://a")).await.unwrap();
        core.transition(&job.id, |j| j.state = JobState::Failed).await.unwrap();

        let result = core
            .transition(&job.id, |j| j.state = JobState::Completed)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(core.job_view(&job.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_enqueue_rejected_after_shutdown() {
        let temp = TempDir::new().unwrap();
        let core = core_with(test_config(), &temp).await;
        core.begin_shutdown(ShutdownSignal::Graceful).await;
        assert!(matches!(
            core.enqueue(spec_for("mock://a")).await,
            Err(QueueError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let job_id;
        {
            let core = core_with(test_config(), &temp).await;
            let job = core.enqueue(spec_for("mock://a")).await.unwrap();
            job_id = job.id.clone();
            core.poll_admissions(Instant::now()).await.unwrap();
            core.transition(&job.id, |j| {
                j.state = JobState::Polling;
                j.external_id = Some("abc".to_string());
            })
            .await
            .unwrap();
        }

        let core = core_with(test_config(), &temp).await;
        let view = core.job_view(&job_id).await.unwrap();
        assert_eq!(view.state, JobState::Polling);
        assert_eq!(view.external_id.as_deref(), Some("abc"));
        assert_eq!(core.resumable_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_drops_terminal_jobs_from_recovery() {
        let temp = TempDir::new().unwrap();
        let keep_id;
        {
            let core = core_with(test_config(), &temp).await;
            let done = core.enqueue(spec_for("mock://a")).await.unwrap();
            let keep = core.enqueue(spec_for("mock://a")).await.unwrap();
            keep_id = keep.id.clone();
            core.transition(&done.id, |j| j.state = JobState::Failed).await.unwrap();
            core.checkpoint().await.unwrap();
        }

        let core = core_with(test_config(), &temp).await;
        let snapshot = core.snapshot().await;
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].id, keep_id);
    }
}
