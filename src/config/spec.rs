use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default minimum delay between restarts
pub const DEFAULT_MIN_RESTART_DELAY: Duration = Duration::from_secs(1);
/// Default cap on the exponential backoff
pub const DEFAULT_MAX_RESTART_DELAY: Duration = Duration::from_secs(60);
/// Default uptime after which a process counts as recovered
pub const DEFAULT_STABLE_AFTER: Duration = Duration::from_secs(60);
/// Default number of restarts tolerated inside the window
pub const DEFAULT_MAX_RESTARTS: usize = 10;
/// Default rolling window for the restart ceiling
pub const DEFAULT_RESTART_WINDOW: Duration = Duration::from_secs(60);
/// Default grace period between the stop signal and SIGKILL
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated, immutable description of one managed process
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: CommandLine,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub logs: LogPaths,
    pub merge_logs: bool,
    /// chrono format string used to prefix each captured line
    pub log_date_format: Option<String>,
    pub autorestart: bool,
    pub memory_limit_bytes: Option<u64>,
    pub instances: usize,
    pub restart: RestartSettings,
    pub stop_signal: StopSignal,
    pub kill_timeout: Duration,
}

impl ProcessSpec {
    /// Log destinations for one instance.
    ///
    /// Multi-instance entries get a `-<index>` suffix so instances never share files.
    pub fn log_paths_for(&self, index: usize) -> LogPaths {
        if self.instances <= 1 {
            return self.logs.clone();
        }
        LogPaths {
            stdout: suffixed(&self.logs.stdout, index),
            stderr: suffixed(&self.logs.stderr, index),
        }
    }
}

fn suffixed(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    path.with_file_name(file_name)
}

/// Executable plus arguments, with any interpreter already prepended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Where captured output goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Backoff and give-up thresholds for automatic restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSettings {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub stable_after: Duration,
    pub max_restarts: usize,
    pub window: Duration,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            min_delay: DEFAULT_MIN_RESTART_DELAY,
            max_delay: DEFAULT_MAX_RESTART_DELAY,
            stable_after: DEFAULT_STABLE_AFTER,
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: DEFAULT_RESTART_WINDOW,
        }
    }
}

/// Signals accepted as a graceful stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Int,
    Quit,
    Kill,
    Hup,
    Usr1,
    Usr2,
}

impl StopSignal {
    pub const NAMES: [&'static str; 7] = [
        "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
    ];

    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Some(StopSignal::Term),
            "INT" => Some(StopSignal::Int),
            "QUIT" => Some(StopSignal::Quit),
            "KILL" => Some(StopSignal::Kill),
            "HUP" => Some(StopSignal::Hup),
            "USR1" => Some(StopSignal::Usr1),
            "USR2" => Some(StopSignal::Usr2),
            _ => None,
        }
    }

    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Kill => Signal::SIGKILL,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::Term
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_nix().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_parse() {
        assert_eq!(StopSignal::parse("SIGTERM"), Some(StopSignal::Term));
        assert_eq!(StopSignal::parse("int"), Some(StopSignal::Int));
        assert_eq!(StopSignal::parse("SIGUSR2"), Some(StopSignal::Usr2));
        assert_eq!(StopSignal::parse("SIGSEGV"), None);
        assert_eq!(StopSignal::Term.to_string(), "SIGTERM");
    }

    #[test]
    fn test_log_paths_suffixed_per_instance() {
        let logs = LogPaths {
            stdout: PathBuf::from("/var/log/app/out.log"),
            stderr: PathBuf::from("/var/log/app/err"),
        };
        let suffixed_out = suffixed(&logs.stdout, 2);
        let suffixed_err = suffixed(&logs.stderr, 0);
        assert_eq!(suffixed_out, PathBuf::from("/var/log/app/out-2.log"));
        assert_eq!(suffixed_err, PathBuf::from("/var/log/app/err-0"));
    }
}
