// Daemon-wide settings resolved from the environment

use crate::config::units::{parse_duration, Quantity};
use crate::error::{Result, WardenError};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the warden home directory
pub const HOME_ENV: &str = "WARDEN_HOME";
/// Environment variable overriding the memory sampling interval
pub const SAMPLE_INTERVAL_ENV: &str = "WARDEN_SAMPLE_INTERVAL";

const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const FALLBACK_HOME: &str = "/tmp/warden";

/// Paths and timings shared by the CLI and the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub home: PathBuf,
    pub socket_path: PathBuf,
    pub pid_path: PathBuf,
    pub daemon_log: PathBuf,
    /// Default directory for process logs without explicit paths
    pub log_dir: PathBuf,
    pub sample_interval: Duration,
}

impl DaemonSettings {
    /// Lay out all paths under `home`
    pub fn with_home<P: AsRef<Path>>(home: P) -> Self {
        let home = home.as_ref().to_path_buf();
        Self {
            socket_path: home.join("warden.sock"),
            pid_path: home.join("wardend.pid"),
            daemon_log: home.join("wardend.log"),
            log_dir: home.join("logs"),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            home,
        }
    }

    /// Resolve settings from `WARDEN_HOME`, `$HOME/.warden` or `/tmp/warden`
    pub fn from_env() -> Result<Self> {
        let home = match std::env::var_os(HOME_ENV) {
            Some(home) if !home.is_empty() => PathBuf::from(home),
            _ => std::env::var_os("HOME")
                .filter(|h| !h.is_empty())
                .map(|h| PathBuf::from(h).join(".warden"))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_HOME)),
        };

        let mut settings = Self::with_home(home);

        if let Ok(raw) = std::env::var(SAMPLE_INTERVAL_ENV) {
            let interval = parse_duration(&Quantity::Text(raw)).map_err(|e| {
                WardenError::Config(format!("{}: {}", SAMPLE_INTERVAL_ENV, e))
            })?;
            if interval.is_zero() {
                return Err(WardenError::Config(format!(
                    "{} must be greater than zero",
                    SAMPLE_INTERVAL_ENV
                )));
            }
            settings.sample_interval = interval;
        }

        Ok(settings)
    }

    /// Create the home and default log directories
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}
