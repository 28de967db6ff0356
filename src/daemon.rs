//! Daemon process management
//!
//! PID file handling, background start via re-exec, and process control.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use eyre::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, warn};

/// Crate version, reported by Ping and written next to the PID file.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daemon process manager, rooted in the runtime directory that also holds
/// the socket and the WAL.
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    version_file: PathBuf,
}

impl DaemonManager {
    pub fn new(runtime_dir: &Path) -> Self {
        Self {
            pid_file: runtime_dir.join("genqueue.pid"),
            version_file: runtime_dir.join("genqueue.version"),
        }
    }

    /// Whether a daemon process is alive.
    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    /// PID of the running daemon, if any.
    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        if !self.pid_file.exists() {
            return None;
        }
        let mut contents = String::new();
        File::open(&self.pid_file).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }
        let mut file = File::create(&self.pid_file).context("Failed to create PID file")?;
        write!(file, "{}", pid).context("Failed to write PID")?;
        debug!(pid, path = ?self.pid_file, "Wrote PID file");
        Ok(())
    }

    fn write_version(&self) -> Result<()> {
        let mut file = File::create(&self.version_file).context("Failed to create version file")?;
        write!(file, "{}", VERSION).context("Failed to write version")?;
        Ok(())
    }

    pub fn read_version(&self) -> Option<String> {
        let mut contents = String::new();
        File::open(&self.version_file).ok()?.read_to_string(&mut contents).ok()?;
        Some(contents.trim().to_string())
    }

    /// Remove the PID and version files after the daemon exits.
    pub fn remove_files(&self) {
        for path in [&self.pid_file, &self.version_file] {
            if path.exists()
                && let Err(e) = fs::remove_file(path)
            {
                warn!(?path, error = %e, "Failed to remove daemon file");
            }
        }
    }

    /// Fork the daemon into the background by re-executing this binary
    /// with the hidden `run-daemon` subcommand.
    pub fn start(&self, config_path: Option<&PathBuf>) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut command = Command::new(&exe);
        command.arg("run-daemon");
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon with SIGTERM, escalating to SIGKILL if it does not
    /// exit within five seconds. The IPC shutdown path is preferred; this
    /// is the fallback.
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon");
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).context("Failed to send SIGTERM")?;
        }

        let mut attempts = 0;
        while is_process_running(pid) && attempts < 50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            attempts += 1;
        }

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }

        self.remove_files();
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Called by the daemon process itself once it owns the runtime dir.
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        self.write_pid(pid)?;
        self.write_version()?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }
}

/// Exclusive lock on the runtime directory so two daemons cannot share one
/// WAL. Held for the daemon's lifetime; released when the returned handle
/// drops.
pub fn acquire_runtime_lock(runtime_dir: &Path) -> Result<File> {
    fs::create_dir_all(runtime_dir).context("Failed to create runtime directory")?;
    let lock_path = runtime_dir.join("genqueue.lock");
    let file = File::create(&lock_path).context("Failed to create lock file")?;
    file.try_lock_exclusive()
        .map_err(|_| eyre::eyre!("Another daemon already owns {}", runtime_dir.display()))?;
    debug!(path = %lock_path.display(), "Runtime lock acquired");
    Ok(file)
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 checks existence without affecting the process
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
