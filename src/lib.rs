//! GenQueue - durable, rate-limited queue daemon for async generation jobs
//!
//! GenQueue mediates submission of asynchronous generate jobs (image,
//! video, audio) to external HTTP/JSON-RPC services that follow a
//! submit -> poll -> result pattern, while enforcing concurrency caps and
//! token-bucket rate limits, and surviving process crashes without losing
//! or duplicating jobs.
//!
//! # Core pieces
//!
//! - [`wal`] - write-ahead log: every job mutation is synced to disk before
//!   it becomes visible, and replay reconstructs the exact job table
//! - [`limiter`] - lazy token buckets, one global scope plus one per
//!   endpoint
//! - [`queue`] - the owned daemon state and the admission scheduler
//! - [`executor`] - the per-job submit/poll/result/download state machine
//! - [`ipc`] - the local control protocol (enqueue/status/cancel/shutdown)
//! - [`service`] - remote-service and downloader collaborators behind
//!   trait seams
//! - [`daemon`] - pid-file and process management
//! - [`config`] / [`cli`] - configuration loading and the `gq` CLI

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod executor;
pub mod ipc;
pub mod limiter;
pub mod queue;
pub mod service;
pub mod wal;

// Re-export commonly used types
pub use config::{ConfigError, EndpointRate, QueueConfig};
pub use domain::{DownloadOutcome, Job, JobSpec, JobState, JobView, OutputRouting, QueueSnapshot};
pub use executor::{JobExecutor, PollStatus, classify, extract_urls};
pub use ipc::{IpcError, QueueClient, Request, Response};
pub use limiter::{LimiterSet, TokenBucket};
pub use queue::{CancelOutcome, Collaborators, QueueCore, QueueError, ShutdownSignal};
pub use service::{
    DownloadError, Downloader, HttpDownloader, MockService, RemoteService, RpcService, ServiceError,
    ServiceRouter, StatusReport,
};
pub use wal::{RecoveredState, WalError, WalEvent, WalRecord, WalStore, rebuild_table, recover};
