// Daemon lifecycle management, as seen from the CLI

use super::pid::PidFile;
use crate::config::{DaemonSettings, HOME_ENV};
use crate::error::{Result, WardenError};
use crate::ipc::client::IpcClient;
use crate::ipc::protocol::{Command, ResponseData};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Name of the daemon executable, looked up next to the CLI first
pub const DAEMON_BINARY: &str = "wardend";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Locates, launches and stops the daemon for one warden home
pub struct DaemonManager {
    settings: DaemonSettings,
    pid_file: PidFile,
    client: IpcClient,
}

impl DaemonManager {
    pub fn new(settings: DaemonSettings) -> Self {
        Self {
            pid_file: PidFile::with_path(&settings.pid_path),
            client: IpcClient::new(&settings.socket_path),
            settings,
        }
    }

    /// A daemon answers on the socket
    pub fn is_running(&self) -> bool {
        self.client.ping()
    }

    pub fn get_pid(&self) -> Option<u32> {
        self.pid_file.live_pid()
    }

    pub fn client(&self) -> &IpcClient {
        &self.client
    }

    /// Claim the PID file for the current process (called from within the daemon)
    pub fn register_daemon(&self) -> Result<()> {
        if self.is_running() {
            return Err(WardenError::DaemonAlreadyRunning);
        }
        match self.pid_file.live_pid() {
            Some(pid) if pid != std::process::id() => {
                return Err(WardenError::DaemonAlreadyRunning)
            }
            _ => {}
        }
        self.pid_file.write()
    }

    /// Release the PID file if it still names this process
    pub fn unregister_daemon(&self) -> Result<()> {
        match self.pid_file.read() {
            Ok(pid) if pid != std::process::id() => Ok(()),
            _ => self.pid_file.remove(),
        }
    }

    /// Launch the daemon in the background; returns its pid without waiting for readiness
    pub fn spawn_daemon(&self) -> Result<u32> {
        self.settings.ensure_dirs()?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.daemon_log)
            .map_err(|e| {
                WardenError::Daemon(format!(
                    "Failed to open daemon log {}: {}",
                    self.settings.daemon_log.display(),
                    e
                ))
            })?;
        let log_err = log
            .try_clone()
            .map_err(|e| WardenError::Daemon(format!("Failed to open daemon log: {}", e)))?;

        let program = daemon_executable();
        debug!("Launching {}", program.display());

        let child = std::process::Command::new(&program)
            .env(HOME_ENV, &self.settings.home)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .map_err(|e| {
                WardenError::Daemon(format!("Failed to launch {}: {}", program.display(), e))
            })?;

        Ok(child.id())
    }

    /// Poll the socket until the daemon answers
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_running() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Err(WardenError::Daemon(format!(
            "Daemon did not come up within {:?}; see {}",
            timeout,
            self.settings.daemon_log.display()
        )))
    }

    /// Ask the daemon to shut down and wait for it to go away.
    ///
    /// A daemon still alive after `timeout` is killed.
    pub fn stop_daemon(&self, timeout: Duration) -> Result<()> {
        let pid = self.get_pid();
        match self.client.send(Command::Kill)? {
            ResponseData::ShuttingDown => {}
            other => {
                return Err(WardenError::Protocol(format!(
                    "Unexpected response to kill: {:?}",
                    other
                )))
            }
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.settings.socket_path.exists() && self.get_pid().is_none() {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let Some(pid) = pid.filter(|_| self.get_pid().is_some()) else {
            return Ok(());
        };
        warn!("Daemon did not stop within {:?}, sending SIGKILL", timeout);
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| WardenError::Signal(format!("Failed to send SIGKILL: {}", e)))?;
        self.pid_file.remove()?;
        let _ = std::fs::remove_file(&self.settings.socket_path);
        Ok(())
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }
}

/// `wardend` beside the current executable, else whatever `PATH` resolves
fn daemon_executable() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY))
}
