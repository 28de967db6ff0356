//! The admission loop
//!
//! Event-driven with a fallback tick: the loop wakes on enqueue, terminal
//! transitions, and cancellations, and otherwise re-checks on a short timer
//! so start-interval and rate-limiter refills are picked up. Only the
//! resulting admission decisions are a contract, not the wake mechanism.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::executor::JobExecutor;
use crate::service::{Downloader, RemoteService};

use super::core::QueueCore;

/// Fallback re-check period for time-based eligibility changes.
const TICK: Duration = Duration::from_millis(200);

/// The external collaborators every executor needs.
pub struct Collaborators {
    pub service: Arc<dyn RemoteService>,
    pub downloader: Arc<dyn Downloader>,
}

/// Re-spawn executors for jobs recovered mid-flight (`Polling` or
/// `Downloading` with an external id). Called once at startup, before the
/// admission loop begins.
pub async fn spawn_recovered(core: &Arc<QueueCore>, collab: &Arc<Collaborators>) -> usize {
    let jobs = core.resumable_jobs().await;
    let count = jobs.len();
    for job in jobs {
        info!(job_id = %job.id, state = %job.state, "Resuming recovered job");
        let executor = JobExecutor::new(core.clone(), collab.clone());
        tokio::spawn(executor.run(job));
    }
    count
}

/// Run admissions until shutdown. Each admitted job gets its own executor
/// task; the loop itself never blocks on the network.
pub fn run_admission_loop(core: Arc<QueueCore>, collab: Arc<Collaborators>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Admission loop started");
        loop {
            if core.is_shutting_down().await {
                break;
            }

            match core.poll_admissions(Instant::now()).await {
                Ok(admitted) => {
                    for job in admitted {
                        let executor = JobExecutor::new(core.clone(), collab.clone());
                        tokio::spawn(executor.run(job));
                    }
                }
                Err(e) => {
                    // Durability failure: the core has already signalled
                    // the emergency shutdown
                    error!(error = %e, "Admission failed");
                    break;
                }
            }

            tokio::select! {
                _ = core.notified() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
        }
        debug!("Admission loop stopped");
    })
}
