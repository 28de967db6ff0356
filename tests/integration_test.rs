//! Integration tests for the GenQueue daemon core
//!
//! These run the real admission loop, executors, WAL, and control protocol
//! against in-process collaborators, covering the end-to-end lifecycle,
//! crash recovery, and the scheduler's ordering guarantees.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use genqueue::config::QueueConfig;
use genqueue::domain::{JobSpec, JobState, OutputRouting};
use genqueue::ipc::{QueueClient, create_listener_at, serve_connection, socket_path};
use genqueue::queue::{Collaborators, QueueCore, ShutdownSignal, run_admission_loop, spawn_recovered};
use genqueue::service::{DownloadError, Downloader, MockService, RemoteService, ServiceError, StatusReport};
use genqueue::wal::{WalStore, recover};

/// Downloader that records "saved" artifacts without any network.
#[derive(Default)]
struct RecordingDownloader {
    fail_urls: Vec<String>,
}

#[async_trait]
impl Downloader for RecordingDownloader {
    async fn fetch(
        &self,
        url: &str,
        routing: &OutputRouting,
        job_id: &str,
        index: usize,
        _total: usize,
    ) -> Result<PathBuf, DownloadError> {
        if self.fail_urls.iter().any(|u| u == url) {
            return Err(DownloadError::Http(format!("refused: {}", url)));
        }
        let dir = routing.output_dir.clone().unwrap_or_else(|| "/tmp".to_string());
        Ok(PathBuf::from(dir).join(format!("{}_{}.out", job_id, index)))
    }
}

/// Service whose jobs stay in `processing` until released, with a submit
/// counter for resubmission checks.
struct GatedService {
    released: AtomicBool,
    submits: AtomicUsize,
    result: Value,
}

impl GatedService {
    fn new(result: Value) -> Self {
        Self {
            released: AtomicBool::new(false),
            submits: AtomicUsize::new(0),
            result,
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteService for GatedService {
    async fn submit(
        &self,
        _endpoint: &str,
        _tool: &str,
        _args: &Value,
        _headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ext-{}", n + 1))
    }

    async fn poll_status(
        &self,
        _endpoint: &str,
        _tool: &str,
        _external_id: &str,
        _id_param: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<StatusReport, ServiceError> {
        let status = if self.released.load(Ordering::SeqCst) {
            "completed"
        } else {
            "processing"
        };
        Ok(StatusReport {
            status: status.to_string(),
            payload: json!({"status": status}),
        })
    }

    async fn fetch_result(
        &self,
        _endpoint: &str,
        _tool: &str,
        _external_id: &str,
        _id_param: &str,
        _headers: &HashMap<String, String>,
    ) -> Result<Value, ServiceError> {
        Ok(self.result.clone())
    }
}

fn fast_config(max_concurrent: u32) -> QueueConfig {
    QueueConfig {
        max_concurrent,
        start_interval: 0.0,
        poll_interval: 0.01,
        global_rate_per_min: 0.0,
        global_burst: 0,
        ..Default::default()
    }
}

fn open_core(temp: &TempDir, config: QueueConfig) -> Arc<QueueCore> {
    let (wal, records) = WalStore::open(temp.path().join("genqueue.wal")).unwrap();
    QueueCore::new(config, wal, recover(&records))
}

fn mock_spec(args: Value) -> JobSpec {
    serde_json::from_value(json!({
        "endpoint": "mock://local",
        "submit_tool": "generate",
        "status_tool": "status",
        "result_tool": "result",
        "args": args,
    }))
    .unwrap()
}

async fn wait_for_state(core: &Arc<QueueCore>, job_id: &str, state: JobState) {
    for _ in 0..500 {
        if let Some(view) = core.job_view(job_id).await
            && view.state == state
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let current = core.job_view(job_id).await.map(|v| v.state);
    panic!("job {} never reached {:?}, currently {:?}", job_id, state, current);
}

// =============================================================================
// End-to-end lifecycle over the control protocol
// =============================================================================

#[tokio::test]
async fn test_enqueue_to_completion_over_ipc() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let socket = socket_path(temp.path());
    let (listener, _) = create_listener_at(&socket).unwrap();
    let server_core = core.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_connection(stream, server_core.clone()));
        }
    });

    let client = QueueClient::new(socket);
    let result = json!({"images": [{"url": "https://cdn.example.com/render.png"}]});
    let job_id = client
        .enqueue(mock_spec(json!({"polls": 1, "result": result})))
        .await
        .unwrap();

    wait_for_state(&core, &job_id, JobState::Completed).await;

    let view = client.job_status(&job_id).await.unwrap();
    assert_eq!(view.state, JobState::Completed);
    assert!(view.external_id.is_some());
    assert_eq!(view.saved_paths.len(), 1);

    let snapshot = client.status().await.unwrap();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.running, 0);

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_partial_download_success_completes_job() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader {
            fail_urls: vec!["https://cdn.example.com/broken.png".to_string()],
        }),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let result = json!({
        "images": [
            {"url": "https://cdn.example.com/broken.png"},
            {"url": "https://cdn.example.com/good.png"},
        ]
    });
    let job = core
        .enqueue(mock_spec(json!({"polls": 0, "result": result})))
        .await
        .unwrap();

    wait_for_state(&core, &job.id, JobState::Completed).await;
    let view = core.job_view(&job.id).await.unwrap();
    // One of two URLs failed; the job still completes and reports both
    assert_eq!(view.saved_paths.len(), 1);

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_all_downloads_failing_fails_job() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader {
            fail_urls: vec!["https://cdn.example.com/broken.png".to_string()],
        }),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let result = json!({"url": "https://cdn.example.com/broken.png"});
    let job = core
        .enqueue(mock_spec(json!({"polls": 0, "result": result})))
        .await
        .unwrap();

    wait_for_state(&core, &job.id, JobState::Failed).await;
    let view = core.job_view(&job.id).await.unwrap();
    assert!(view.last_error.as_deref().unwrap().contains("downloads failed"));

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_remote_failure_is_terminal_with_verbatim_error() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let job = core
        .enqueue(mock_spec(json!({"polls": 0, "fail_status": "failed"})))
        .await
        .unwrap();

    wait_for_state(&core, &job.id, JobState::Failed).await;
    let view = core.job_view(&job.id).await.unwrap();
    assert!(view.last_error.as_deref().unwrap().contains("failed"));

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_poll_budget_exhaustion_times_out() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let mut spec = mock_spec(json!({"polls": 1000}));
    spec.max_polls = 3;
    let job = core.enqueue(spec).await.unwrap();

    wait_for_state(&core, &job.id, JobState::Failed).await;
    let view = core.job_view(&job.id).await.unwrap();
    assert!(view.last_error.as_deref().unwrap().contains("timed out after 3"));
    assert_eq!(view.polls, 3);

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

// =============================================================================
// Scheduler ordering guarantees
// =============================================================================

#[tokio::test]
async fn test_concurrency_cap_third_job_waits_for_terminal() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(2));
    let service = Arc::new(GatedService::new(json!({})));
    let collab = Arc::new(Collaborators {
        service: service.clone(),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let j1 = core.enqueue(mock_spec(json!({}))).await.unwrap();
    let j2 = core.enqueue(mock_spec(json!({}))).await.unwrap();
    let j3 = core.enqueue(mock_spec(json!({}))).await.unwrap();

    wait_for_state(&core, &j1.id, JobState::Polling).await;
    wait_for_state(&core, &j2.id, JobState::Polling).await;

    // Both slots taken; J3 must still be queued
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(core.job_view(&j3.id).await.unwrap().state, JobState::Queued);
    assert_eq!(core.active_count().await, 2);

    // Terminal transitions free the slots and J3 runs
    service.release();
    wait_for_state(&core, &j3.id, JobState::Completed).await;

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_cancel_queued_job_before_admission() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(1));
    let service = Arc::new(GatedService::new(json!({})));
    let collab = Arc::new(Collaborators {
        service: service.clone(),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    // Fill the single slot, then cancel the waiting job
    let blocker = core.enqueue(mock_spec(json!({}))).await.unwrap();
    let victim = core.enqueue(mock_spec(json!({}))).await.unwrap();
    wait_for_state(&core, &blocker.id, JobState::Polling).await;

    core.cancel(&victim.id).await.unwrap();
    wait_for_state(&core, &victim.id, JobState::Cancelled).await;

    service.release();
    wait_for_state(&core, &blocker.id, JobState::Completed).await;

    // The cancelled job never ran: one submit total, and it stays Cancelled
    assert_eq!(service.submits.load(Ordering::SeqCst), 1);
    assert_eq!(core.job_view(&victim.id).await.unwrap().state, JobState::Cancelled);

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_cancel_in_flight_observed_between_polls() {
    let temp = TempDir::new().unwrap();
    let core = open_core(&temp, fast_config(1));
    let service = Arc::new(GatedService::new(json!({})));
    let collab = Arc::new(Collaborators {
        service: service.clone(),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let admission = run_admission_loop(core.clone(), collab);

    let job = core.enqueue(mock_spec(json!({}))).await.unwrap();
    wait_for_state(&core, &job.id, JobState::Polling).await;

    core.cancel(&job.id).await.unwrap();
    wait_for_state(&core, &job.id, JobState::Cancelled).await;

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test]
async fn test_restart_resumes_polling_without_resubmitting() {
    let temp = TempDir::new().unwrap();
    let job_id;

    // First life: the job reaches Polling with an external id, then the
    // process "crashes" (core dropped without shutdown)
    {
        let core = open_core(&temp, fast_config(2));
        let job = core.enqueue(mock_spec(json!({}))).await.unwrap();
        job_id = job.id.clone();
        core.poll_admissions(Instant::now()).await.unwrap();
        core.transition(&job.id, |j| {
            j.state = JobState::Submitting;
        })
        .await
        .unwrap();
        core.transition(&job.id, |j| {
            j.external_id = Some("abc".to_string());
            j.state = JobState::Polling;
        })
        .await
        .unwrap();
    }

    // Second life: recovery leaves the job in Polling with the same
    // external id and resumes polling rather than resubmitting
    let core = open_core(&temp, fast_config(2));
    let view = core.job_view(&job_id).await.unwrap();
    assert_eq!(view.state, JobState::Polling);
    assert_eq!(view.external_id.as_deref(), Some("abc"));

    let service = Arc::new(GatedService::new(json!({})));
    service.release();
    let collab = Arc::new(Collaborators {
        service: service.clone(),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    let resumed = spawn_recovered(&core, &collab).await;
    assert_eq!(resumed, 1);

    wait_for_state(&core, &job_id, JobState::Completed).await;
    let view = core.job_view(&job_id).await.unwrap();
    assert_eq!(view.external_id.as_deref(), Some("abc"));
    assert_eq!(service.submits.load(Ordering::SeqCst), 0, "must not resubmit");
}

#[tokio::test]
async fn test_restart_resets_unconfirmed_submit_to_queued() {
    let temp = TempDir::new().unwrap();
    let job_id;
    {
        let core = open_core(&temp, fast_config(2));
        let job = core.enqueue(mock_spec(json!({"polls": 0}))).await.unwrap();
        job_id = job.id.clone();
        core.poll_admissions(Instant::now()).await.unwrap();
        // Crash mid-submit: Submitting persisted, no external id yet
        core.transition(&job.id, |j| j.state = JobState::Submitting).await.unwrap();
    }

    let core = open_core(&temp, fast_config(2));
    let view = core.job_view(&job_id).await.unwrap();
    assert_eq!(view.state, JobState::Queued, "unconfirmed submit resets to queued");

    // The requeued job runs to completion through normal admission
    let collab = Arc::new(Collaborators {
        service: Arc::new(MockService::new()),
        downloader: Arc::new(RecordingDownloader::default()),
    });
    assert_eq!(spawn_recovered(&core, &collab).await, 0);
    let admission = run_admission_loop(core.clone(), collab);
    wait_for_state(&core, &job_id, JobState::Completed).await;

    core.begin_shutdown(ShutdownSignal::Graceful).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
}

#[tokio::test]
async fn test_no_job_is_lost_across_restart() {
    let temp = TempDir::new().unwrap();
    let mut ids = Vec::new();
    {
        let core = open_core(&temp, fast_config(2));
        for _ in 0..5 {
            ids.push(core.enqueue(mock_spec(json!({}))).await.unwrap().id);
        }
    }

    let core = open_core(&temp, fast_config(2));
    let snapshot = core.snapshot().await;
    assert_eq!(snapshot.jobs.len(), 5);
    for id in &ids {
        assert_eq!(core.job_view(id).await.unwrap().state, JobState::Queued);
    }
    // FIFO order survives the restart
    let listed: Vec<String> = snapshot.jobs.iter().map(|j| j.id.clone()).collect();
    assert_eq!(listed, ids);
}
