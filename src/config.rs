//! Queue daemon configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Configuration errors. Raised at startup, before any job is accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-endpoint token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRate {
    /// Tokens added per minute; zero or negative means unlimited
    #[serde(rename = "rate-per-min")]
    pub rate_per_min: f64,

    /// Bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    5
}

/// Queue daemon configuration, loaded once at startup and immutable for the
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum jobs allowed past admission at any instant
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: u32,

    /// Minimum seconds between consecutive admissions
    #[serde(rename = "start-interval")]
    pub start_interval: f64,

    /// Default seconds between status polls for specs that omit it
    #[serde(rename = "poll-interval")]
    pub poll_interval: f64,

    /// Global token bucket refill rate; zero means unlimited
    #[serde(rename = "global-rate-per-min")]
    pub global_rate_per_min: f64,

    /// Global token bucket capacity
    #[serde(rename = "global-burst")]
    pub global_burst: u32,

    /// Per-endpoint token buckets
    #[serde(rename = "endpoint-rates")]
    pub endpoint_rates: HashMap<String, EndpointRate>,

    /// Seconds a job may spend overall; derives the default poll budget
    #[serde(rename = "job-timeout")]
    pub job_timeout: f64,

    /// Seconds a graceful shutdown waits for in-flight jobs
    #[serde(rename = "shutdown-grace")]
    pub shutdown_grace: f64,

    /// WAL size threshold (bytes) that triggers a checkpoint
    #[serde(rename = "wal-checkpoint-bytes")]
    pub wal_checkpoint_bytes: u64,

    /// Runtime directory for the socket, pid file, and WAL
    #[serde(rename = "runtime-dir")]
    pub runtime_dir: Option<PathBuf>,

    /// Log level override (CLI --log-level wins)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            start_interval: 1.0,
            poll_interval: 30.0,
            global_rate_per_min: 10.0,
            global_burst: 5,
            endpoint_rates: HashMap::new(),
            job_timeout: 900.0,
            shutdown_grace: 30.0,
            wal_checkpoint_bytes: 1024 * 1024,
            runtime_dir: None,
            log_level: None,
        }
    }
}

impl QueueConfig {
    /// Load configuration with fallback chain: explicit path, then
    /// `.genqueue.yml` in the working directory, then
    /// `~/.config/genqueue/genqueue.yml`, then defaults. Environment
    /// variables override whatever was loaded.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path)?
        } else {
            Self::load_first_found()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_first_found() -> Self {
        let mut candidates = vec![PathBuf::from(".genqueue.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("genqueue").join("genqueue.yml"));
        }

        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return config,
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Skipping unreadable config file");
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str.clone(),
            source,
        })?;
        tracing::info!(path = %path_str, "Loaded config");
        Ok(config)
    }

    /// `GENQUEUE_*` environment variables override file values.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u32>("GENQUEUE_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = env_parse::<f64>("GENQUEUE_RATE_PER_MIN") {
            self.global_rate_per_min = v;
        }
        if let Some(v) = env_parse::<u32>("GENQUEUE_BURST") {
            self.global_burst = v;
        }
        if let Some(v) = env_parse::<f64>("GENQUEUE_JOB_TIMEOUT") {
            self.job_timeout = v;
        }
        if let Some(v) = env_parse::<f64>("GENQUEUE_START_INTERVAL") {
            self.start_interval = v;
        }
    }

    /// Read just the log level, for logging setup before the full load.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    /// Validate rate and concurrency settings; fail fast before accepting
    /// any job.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max-concurrent must be at least 1".into()));
        }
        if !self.start_interval.is_finite() || self.start_interval < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "start-interval {} must be a non-negative number",
                self.start_interval
            )));
        }
        if !self.poll_interval.is_finite() || self.poll_interval <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "poll-interval {} must be positive",
                self.poll_interval
            )));
        }
        if !self.job_timeout.is_finite() || self.job_timeout <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "job-timeout {} must be positive",
                self.job_timeout
            )));
        }
        if self.global_rate_per_min > 0.0 && self.global_burst == 0 {
            return Err(ConfigError::Invalid(
                "global-burst must be at least 1 when global-rate-per-min is set".into(),
            ));
        }
        for (endpoint, rate) in &self.endpoint_rates {
            if rate.rate_per_min > 0.0 && rate.burst == 0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint-rates[{}]: burst must be at least 1 when rate-per-min is set",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    /// Runtime directory holding the socket, pid file, and WAL.
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("genqueue")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
