//! CLI command definitions and exit codes

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::{Context, Result};

use crate::domain::{JobSpec, OutputRouting};
use crate::ipc::IpcError;

/// GenQueue - durable rate-limited queue daemon for async generation jobs
#[derive(Parser)]
#[command(
    name = "gq",
    about = "Durable, rate-limited queue daemon for async generation jobs",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon in the background
    Start {
        /// Run in the foreground instead of forking
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon (graceful over IPC, SIGTERM fallback)
    Stop,

    /// Show queue status, or one job's status
    Status {
        /// Inspect a single job
        #[arg(long, value_name = "ID")]
        job: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Queue a generation job
    Enqueue(EnqueueArgs),

    /// Cancel a job
    Cancel {
        /// Job id as reported by enqueue/status
        job_id: String,
    },

    /// Shut the daemon down
    Shutdown {
        /// Exit immediately instead of draining in-flight jobs
        #[arg(long)]
        force: bool,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Internal: run as the daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Job submission arguments. Either a spec file or inline flags.
#[derive(Args)]
pub struct EnqueueArgs {
    /// Job spec file (JSON or YAML)
    #[arg(short, long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Remote service endpoint URL
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Submit tool name
    #[arg(long)]
    pub submit_tool: Option<String>,

    /// Status tool name
    #[arg(long, default_value = "status")]
    pub status_tool: String,

    /// Result tool name
    #[arg(long, default_value = "result")]
    pub result_tool: String,

    /// Submit arguments as a JSON object
    #[arg(short, long, value_name = "JSON")]
    pub args: Option<String>,

    /// Output directory for downloaded artifacts
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<String>,

    /// Output file path (overrides the derived name)
    #[arg(long, value_name = "FILE")]
    pub output_file: Option<String>,

    /// Name artifacts {job_id}_{timestamp}.{ext}
    #[arg(long)]
    pub auto_filename: bool,

    /// Extra HTTP header, Key:Value (repeatable)
    #[arg(long = "header", value_name = "KEY:VALUE")]
    pub headers: Vec<String>,

    /// Seconds between status polls
    #[arg(long)]
    pub poll_interval: Option<f64>,

    /// Maximum status polls
    #[arg(long)]
    pub max_polls: Option<u32>,

    /// Remote parameter name for the external job id
    #[arg(long)]
    pub id_param: Option<String>,

    /// Block until the job reaches a terminal state
    #[arg(short, long)]
    pub wait: bool,
}

impl EnqueueArgs {
    /// Build the job spec from a file or inline flags; flags override file
    /// fields.
    pub fn to_spec(&self) -> Result<JobSpec> {
        let mut spec: JobSpec = if let Some(path) = &self.file {
            let content = std::fs::read_to_string(path)
                .context(format!("Failed to read spec file {}", path.display()))?;
            serde_yaml::from_str(&content).context(format!("Failed to parse spec file {}", path.display()))?
        } else {
            let endpoint = self
                .endpoint
                .clone()
                .ok_or_else(|| eyre::eyre!("--endpoint is required without --file"))?;
            let submit_tool = self
                .submit_tool
                .clone()
                .ok_or_else(|| eyre::eyre!("--submit-tool is required without --file"))?;
            JobSpec {
                endpoint,
                submit_tool,
                status_tool: self.status_tool.clone(),
                result_tool: self.result_tool.clone(),
                args: serde_json::Value::Object(serde_json::Map::new()),
                headers: HashMap::new(),
                id_param: "request_id".to_string(),
                poll_interval: 0.0,
                max_polls: 0,
                output: OutputRouting::default(),
            }
        };

        if let Some(args) = &self.args {
            spec.args = serde_json::from_str(args).context("--args is not valid JSON")?;
        }
        if !self.headers.is_empty() {
            spec.headers = parse_headers(&self.headers)?;
        }
        if let Some(v) = self.poll_interval {
            spec.poll_interval = v;
        }
        if let Some(v) = self.max_polls {
            spec.max_polls = v;
        }
        if let Some(v) = &self.id_param {
            spec.id_param = v.clone();
        }
        if self.output.is_some() || self.output_file.is_some() || self.auto_filename {
            spec.output = OutputRouting {
                output_dir: self.output.clone().or(spec.output.output_dir),
                output_file: self.output_file.clone().or(spec.output.output_file),
                auto_filename: self.auto_filename || spec.output.auto_filename,
            };
        }
        Ok(spec)
    }
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| eyre::eyre!("Invalid header '{}', expected Key:Value", entry))?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

/// Output format for status
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

/// Process exit codes. Distinct non-zero codes let scripts tell a missing
/// daemon from a missing job from a timeout.
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_RUNNING: i32 = 2;
pub const EXIT_JOB_NOT_FOUND: i32 = 3;
pub const EXIT_TIMEOUT: i32 = 4;

/// Map a client error to its exit code.
pub fn exit_code_for(err: &IpcError) -> i32 {
    match err {
        IpcError::NotRunning => EXIT_NOT_RUNNING,
        IpcError::JobNotFound(_) => EXIT_JOB_NOT_FOUND,
        IpcError::Timeout => EXIT_TIMEOUT,
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let cli = Cli::parse_from(["gq", "status"]);
        assert!(matches!(cli.command, Command::Status { job: None, .. }));
    }

    #[test]
    fn test_parse_status_with_job() {
        let cli = Cli::parse_from(["gq", "status", "--job", "job-1"]);
        let Command::Status { job, .. } = cli.command else {
            panic!("expected Status");
        };
        assert_eq!(job.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_parse_start_foreground() {
        let cli = Cli::parse_from(["gq", "start", "--foreground"]);
        assert!(matches!(cli.command, Command::Start { foreground: true }));
    }

    #[test]
    fn test_parse_shutdown_force() {
        let cli = Cli::parse_from(["gq", "shutdown", "--force"]);
        assert!(matches!(cli.command, Command::Shutdown { force: true }));
    }

    #[test]
    fn test_parse_cancel() {
        let cli = Cli::parse_from(["gq", "cancel", "job-9"]);
        let Command::Cancel { job_id } = cli.command else {
            panic!("expected Cancel");
        };
        assert_eq!(job_id, "job-9");
    }

    #[test]
    fn test_enqueue_inline_spec() {
        let cli = Cli::parse_from([
            "gq",
            "enqueue",
            "--endpoint",
            "https://api.example.com/mcp",
            "--submit-tool",
            "generate_image",
            "--args",
            r#"{"prompt": "a lighthouse"}"#,
            "--header",
            "Authorization: Bearer tok",
            "--output",
            "./renders",
        ]);
        let Command::Enqueue(args) = cli.command else {
            panic!("expected Enqueue");
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.endpoint, "https://api.example.com/mcp");
        assert_eq!(spec.submit_tool, "generate_image");
        assert_eq!(spec.status_tool, "status");
        assert_eq!(spec.args["prompt"], "a lighthouse");
        assert_eq!(spec.headers["Authorization"], "Bearer tok");
        assert_eq!(spec.output.output_dir.as_deref(), Some("./renders"));
    }

    #[test]
    fn test_enqueue_requires_endpoint_without_file() {
        let cli = Cli::parse_from(["gq", "enqueue", "--submit-tool", "generate"]);
        let Command::Enqueue(args) = cli.command else {
            panic!("expected Enqueue");
        };
        assert!(args.to_spec().is_err());
    }

    #[test]
    fn test_enqueue_spec_file_with_overrides() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("spec.json");
        std::fs::write(
            &path,
            r#"{"endpoint": "mock://local", "submit_tool": "generate",
               "status_tool": "status", "result_tool": "result", "poll_interval": 10.0}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "gq",
            "enqueue",
            "--file",
            path.to_str().unwrap(),
            "--poll-interval",
            "2.5",
        ]);
        let Command::Enqueue(args) = cli.command else {
            panic!("expected Enqueue");
        };
        let spec = args.to_spec().unwrap();
        assert_eq!(spec.endpoint, "mock://local");
        assert_eq!(spec.poll_interval, 2.5);
    }

    #[test]
    fn test_invalid_header_rejected() {
        assert!(parse_headers(&["no-colon".to_string()]).is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("csv".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            exit_code_for(&IpcError::NotRunning),
            exit_code_for(&IpcError::JobNotFound("x".into())),
            exit_code_for(&IpcError::Timeout),
            exit_code_for(&IpcError::Daemon("x".into())),
        ];
        assert_eq!(codes, [2, 3, 4, 1]);
    }
}
