//! GenQueue CLI entry point
//!
//! Client commands talk to a running daemon over the control socket; the
//! hidden `run-daemon` subcommand is the daemon process itself.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{error, info, warn};

use genqueue::cli::{Cli, Command, EnqueueArgs, OutputFormat, exit_code_for};
use genqueue::config::QueueConfig;
use genqueue::daemon::{DaemonManager, acquire_runtime_lock};
use genqueue::domain::{JobState, JobView, QueueSnapshot};
use genqueue::ipc::{self, IpcError, QueueClient, serve_connection};
use genqueue::queue::{Collaborators, QueueCore, ShutdownSignal, run_admission_loop, spawn_recovered};
use genqueue::service::{HttpDownloader, ServiceRouter};
use genqueue::wal::{WalStore, recover};

fn log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("genqueue")
        .join("logs")
        .join("genqueue.log")
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_file = log_path();
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = QueueConfig::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = match QueueConfig::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            exit(genqueue::cli::EXIT_FAILURE);
        }
    };

    match cli.command {
        Command::Start { foreground } => cmd_start(&config, cli.config.as_ref(), foreground).await,
        Command::Stop => cmd_stop(&config).await,
        Command::Status { job, format } => cmd_status(&config, job.as_deref(), format).await,
        Command::Enqueue(args) => cmd_enqueue(&config, args).await,
        Command::Cancel { job_id } => cmd_cancel(&config, &job_id).await,
        Command::Shutdown { force } => cmd_shutdown(&config, force).await,
        Command::Logs { follow, lines } => cmd_logs(follow, lines),
        Command::RunDaemon => run_daemon(config).await,
    }
}

fn client_for(config: &QueueConfig) -> QueueClient {
    QueueClient::new(ipc::socket_path(&config.runtime_dir()))
}

fn fail_ipc(err: IpcError) -> ! {
    eprintln!("{}", err);
    exit(exit_code_for(&err));
}

/// Start the daemon
async fn cmd_start(config: &QueueConfig, config_path: Option<&PathBuf>, foreground: bool) -> Result<()> {
    let manager = DaemonManager::new(&config.runtime_dir());
    if let Some(pid) = manager.running_pid() {
        println!("GenQueue daemon is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting GenQueue daemon in the foreground...");
        run_daemon(config.clone()).await
    } else {
        let pid = manager.start(config_path)?;
        println!("GenQueue daemon started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon: graceful IPC shutdown first, SIGTERM fallback.
async fn cmd_stop(config: &QueueConfig) -> Result<()> {
    let manager = DaemonManager::new(&config.runtime_dir());
    if !manager.is_running() {
        println!("GenQueue daemon is not running");
        return Ok(());
    }

    let client = client_for(config);
    if client.socket_exists() {
        match client.shutdown(false).await {
            Ok(()) => {
                let mut attempts = 0;
                while manager.is_running() && attempts < 100 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    attempts += 1;
                }
                if !manager.is_running() {
                    manager.remove_files();
                    println!("GenQueue daemon stopped");
                    return Ok(());
                }
                warn!("IPC shutdown acknowledged but the process is still alive");
            }
            Err(e) => warn!(error = %e, "IPC shutdown failed, falling back to SIGTERM"),
        }
    }

    manager.stop()?;
    println!("GenQueue daemon stopped");
    Ok(())
}

/// Show queue or job status
async fn cmd_status(config: &QueueConfig, job: Option<&str>, format: OutputFormat) -> Result<()> {
    let client = client_for(config);
    match job {
        Some(job_id) => match client.job_status(job_id).await {
            Ok(view) => print_job(&view, &format),
            Err(e) => fail_ipc(e),
        },
        None => match client.status().await {
            Ok(snapshot) => print_snapshot(&snapshot, &format),
            Err(e) => fail_ipc(e),
        },
    }
    Ok(())
}

fn print_job(view: &JobView, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(view).unwrap_or_default());
        }
        OutputFormat::Text => {
            println!("Job:       {}", view.id);
            println!("State:     {}", view.state);
            println!("Endpoint:  {} -> {}", view.endpoint, view.submit_tool);
            if let Some(external_id) = &view.external_id {
                println!("Remote id: {}", external_id);
            }
            println!("Polls:     {} (attempt {})", view.polls, view.attempts);
            if let Some(error) = &view.last_error {
                println!("Error:     {}", error);
            }
            for path in &view.saved_paths {
                println!("Saved:     {}", path);
            }
        }
    }
}

fn print_snapshot(snapshot: &QueueSnapshot, format: &OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(snapshot).unwrap_or_default());
        }
        OutputFormat::Text => {
            println!("=== GenQueue Status ===");
            println!("Queued:    {}", snapshot.queued);
            println!("Running:   {}", snapshot.running);
            println!("Completed: {}", snapshot.completed);
            println!("Failed:    {}", snapshot.failed);
            println!("Cancelled: {}", snapshot.cancelled);
            if !snapshot.jobs.is_empty() {
                println!("\n--- Jobs ---");
                for job in &snapshot.jobs {
                    let id_prefix: String = job.id.chars().take(8).collect();
                    println!(
                        "  {}... [{}] {} -> {}",
                        id_prefix, job.state, job.endpoint, job.submit_tool
                    );
                }
            }
        }
    }
}

/// Queue a job, optionally waiting for it to finish
async fn cmd_enqueue(config: &QueueConfig, args: EnqueueArgs) -> Result<()> {
    let wait = args.wait;
    let spec = args.to_spec()?;
    let client = client_for(config);

    let job_id = match client.enqueue(spec).await {
        Ok(job_id) => job_id,
        Err(e) => fail_ipc(e),
    };
    println!("Job queued: {}", job_id);

    if !wait {
        return Ok(());
    }

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = match client.job_status(&job_id).await {
            Ok(view) => view,
            Err(e) => fail_ipc(e),
        };
        if view.state.is_terminal() {
            print_job(&view, &OutputFormat::Text);
            match view.state {
                JobState::Completed => return Ok(()),
                _ => exit(genqueue::cli::EXIT_FAILURE),
            }
        }
    }
}

/// Cancel a job
async fn cmd_cancel(config: &QueueConfig, job_id: &str) -> Result<()> {
    let client = client_for(config);
    match client.cancel(job_id).await {
        Ok(()) => {
            println!("Cancel requested for {}", job_id);
            Ok(())
        }
        Err(e) => fail_ipc(e),
    }
}

/// Shut the daemon down
async fn cmd_shutdown(config: &QueueConfig, force: bool) -> Result<()> {
    let client = client_for(config);
    match client.shutdown(force).await {
        Ok(()) => {
            println!("Shutdown requested");
            Ok(())
        }
        Err(e) => fail_ipc(e),
    }
}

/// Show daemon logs
fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    let path = log_path();
    if !path.exists() {
        println!("No log file at {}", path.display());
        return Ok(());
    }

    let content = fs::read_to_string(&path).context("Failed to read log file")?;
    let all_lines: Vec<&str> = content.lines().collect();
    let start = all_lines.len().saturating_sub(lines);
    for line in &all_lines[start..] {
        println!("{}", line);
    }

    if !follow {
        return Ok(());
    }

    let mut file = fs::File::open(&path)?;
    let mut position = file.metadata()?.len();
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let len = file.metadata()?.len();
        if len > position {
            file.seek(SeekFrom::Start(position))?;
            let mut buffer = String::new();
            file.read_to_string(&mut buffer)?;
            print!("{}", buffer);
            position = len;
        } else if len < position {
            // Log rotated or truncated; start over
            position = 0;
            file = fs::File::open(&path)?;
        }
    }
}

/// The daemon process: recover, listen, admit, drain, checkpoint.
async fn run_daemon(config: QueueConfig) -> Result<()> {
    // Fail fast on bad rate/concurrency settings, before accepting any job
    config.validate()?;

    let runtime_dir = config.runtime_dir();
    let _runtime_lock = acquire_runtime_lock(&runtime_dir)?;
    let manager = DaemonManager::new(&runtime_dir);
    manager.register_self()?;

    let (wal, records) = WalStore::open(runtime_dir.join("genqueue.wal"))?;
    let recovered = recover(&records);
    let core = QueueCore::new(config.clone(), wal, recovered);

    let collab = Arc::new(Collaborators {
        service: Arc::new(ServiceRouter::new()),
        downloader: Arc::new(HttpDownloader::new()),
    });

    let resumed = spawn_recovered(&core, &collab).await;
    if resumed > 0 {
        info!(resumed, "Resumed in-flight jobs from the WAL");
    }
    let admission = run_admission_loop(core.clone(), collab.clone());

    let socket = ipc::socket_path(&runtime_dir);
    let (listener, socket) = ipc::create_listener_at(&socket)?;
    info!(socket = %socket.display(), max_concurrent = config.max_concurrent,
        start_interval = config.start_interval, rate_per_min = config.global_rate_per_min,
        burst = config.global_burst, "GenQueue daemon listening");

    let mut shutdown_rx = core.subscribe_shutdown();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    while *shutdown_rx.borrow() == ShutdownSignal::None {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, core.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept control connection"),
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                core.begin_shutdown(ShutdownSignal::Graceful).await;
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
                core.begin_shutdown(ShutdownSignal::Graceful).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() != ShutdownSignal::None {
                    break;
                }
            }
        }
    }

    let mode = *shutdown_rx.borrow();
    if mode == ShutdownSignal::Graceful {
        let grace = Duration::from_secs_f64(config.shutdown_grace);
        info!(grace_secs = config.shutdown_grace, "Draining in-flight jobs");
        if core.wait_for_drain(grace).await {
            info!("All jobs drained");
        } else {
            warn!("Grace period elapsed; in-flight jobs will resume from the WAL on next start");
        }
        if let Err(e) = core.checkpoint().await {
            error!(error = %e, "Final checkpoint failed");
        }
    } else {
        info!("Immediate shutdown; relying on WAL recovery");
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), admission).await;
    ipc::cleanup_socket(&socket);
    manager.remove_files();
    info!("GenQueue daemon stopped");
    Ok(())
}
