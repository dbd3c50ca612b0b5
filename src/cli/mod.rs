// CLI module - User-facing command-line interface

mod output;

use crate::config::DaemonSettings;
use crate::daemon::DaemonManager;
use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, LogReport, ResponseData};
use crate::logs::{read_logs, LogFollower};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::time::Duration;

const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);
const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_LOG_LINES: usize = 15;

/// warden - a small process supervisor
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start processes from a config file, or restart a stopped one by name
    Start {
        /// Path to a .json or .toml config file, or the name of a loaded process
        target: String,
    },

    /// Stop every instance of a process
    Stop { name: String },

    /// Restart every instance of a process
    Restart { name: String },

    /// Stop a process and forget it
    Delete { name: String },

    /// Show the state of every managed instance
    #[command(alias = "list", alias = "ls")]
    Status,

    /// Print recent output of a process
    Logs {
        name: String,

        /// Number of lines to display per destination
        #[arg(short, long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,

        /// Keep printing new output
        #[arg(short, long)]
        follow: bool,
    },

    /// Stop every process and shut the daemon down
    Kill,
}

impl Cli {
    /// Parse arguments and run.
    ///
    /// # Returns
    /// The process exit code for a completed command
    pub fn run() -> Result<i32> {
        let cli = Cli::parse();
        let settings = DaemonSettings::from_env()?;
        cli.execute(DaemonManager::new(settings))
    }

    fn execute(&self, daemon: DaemonManager) -> Result<i32> {
        match &self.command {
            Commands::Start { target } => {
                let command = start_command(target)?;
                ensure_daemon(&daemon)?;
                match daemon.client().send(command)? {
                    ResponseData::Started(report) => {
                        output::print_start_report(&report);
                        Ok(report.exit_code())
                    }
                    ResponseData::Instances(instances) => {
                        output::print_instances("started", &instances);
                        Ok(0)
                    }
                    other => Err(unexpected(other)),
                }
            }

            Commands::Stop { name } => {
                affect(&daemon, Command::Stop { name: name.clone() }, "stopped")
            }
            Commands::Restart { name } => {
                affect(&daemon, Command::Restart { name: name.clone() }, "restarted")
            }
            Commands::Delete { name } => {
                affect(&daemon, Command::Delete { name: name.clone() }, "deleted")
            }

            Commands::Status => match daemon.client().send(Command::Status) {
                Ok(ResponseData::Instances(instances)) => {
                    output::print_status_table(&instances);
                    Ok(0)
                }
                Ok(other) => Err(unexpected(other)),
                Err(WardenError::DaemonNotRunning) => {
                    output::print_info("Daemon is not running");
                    Ok(0)
                }
                Err(e) => Err(e),
            },

            Commands::Logs {
                name,
                lines,
                follow,
            } => {
                let report = match daemon.client().send(Command::Logs { name: name.clone() })? {
                    ResponseData::Logs(report) => report,
                    other => return Err(unexpected(other)),
                };
                print_logs(&report, *lines, *follow)?;
                Ok(0)
            }

            Commands::Kill => {
                if !daemon.is_running() {
                    output::print_info("Daemon is not running");
                    return Ok(0);
                }
                let pb = output::create_progress_bar("Stopping processes and daemon...");
                match daemon.stop_daemon(DAEMON_STOP_TIMEOUT) {
                    Ok(()) => {
                        output::finish_progress_success(pb, "Daemon stopped");
                        Ok(0)
                    }
                    Err(e) => {
                        output::finish_progress_error(pb, "Failed to stop daemon");
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Print an error the way every command reports failures
pub fn report_error(error: &WardenError) {
    output::print_error(&error.to_string());
}

/// Start `wardend` unless it already answers
fn ensure_daemon(daemon: &DaemonManager) -> Result<()> {
    if daemon.is_running() {
        return Ok(());
    }

    let pb = output::create_progress_bar("Starting daemon...");
    let started = daemon
        .spawn_daemon()
        .and_then(|pid| daemon.wait_until_ready(DAEMON_START_TIMEOUT).map(|_| pid));
    match started {
        Ok(pid) => {
            output::finish_progress_success(pb, &format!("Daemon started (pid {})", pid));
            Ok(())
        }
        Err(e) => {
            output::finish_progress_error(pb, "Daemon failed to start");
            Err(e)
        }
    }
}

/// An existing path is a config file; anything else names a loaded process
fn start_command(target: &str) -> Result<Command> {
    let path = Path::new(target);
    if path.exists() {
        let path = path.canonicalize().map_err(|e| {
            WardenError::Config(format!("Failed to resolve {}: {}", path.display(), e))
        })?;
        return Ok(Command::StartFile { path });
    }
    if looks_like_config(path) {
        return Err(WardenError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Ok(Command::StartName {
        name: target.to_string(),
    })
}

fn looks_like_config(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("toml")
    ) || path.components().count() > 1
}

fn affect(daemon: &DaemonManager, command: Command, action: &str) -> Result<i32> {
    match daemon.client().send(command)? {
        ResponseData::Instances(instances) => {
            output::print_instances(action, &instances);
            Ok(0)
        }
        other => Err(unexpected(other)),
    }
}

fn unexpected(data: ResponseData) -> WardenError {
    WardenError::Protocol(format!("Unexpected response: {:?}", data))
}

/// Tail the files named in `report`, then optionally follow them until interrupted
fn print_logs(report: &LogReport, lines: usize, follow: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| WardenError::Log(format!("Failed to start log reader: {}", e)))?;

    runtime.block_on(async {
        for instance in &report.instances {
            output::print_log_header(report, instance.index, instance.merged);
            for entry in read_logs(&instance.paths, instance.merged, lines).await? {
                output::print_log_entry(&entry);
            }
        }

        if !follow {
            return Ok(());
        }

        output::print_info("Following new output (Ctrl-C to stop)");
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);
        for instance in &report.instances {
            let mut follower = LogFollower::new(&instance.paths, instance.merged).await;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(entry) = follower.next().await {
                    if tx.send(entry).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        while let Some(entry) = rx.recv().await {
            output::print_log_entry(&entry);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_start_existing_file_is_a_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = temp_dir.path().join("apps.json");
        std::fs::write(&config, "{}").unwrap();

        match start_command(config.to_str().unwrap()).unwrap() {
            Command::StartFile { path } => {
                assert!(path.is_absolute());
                assert!(path.ends_with("apps.json"));
            }
            other => panic!("Expected StartFile, got {:?}", other),
        }
    }

    #[test]
    fn test_start_bare_word_is_a_name() {
        assert_eq!(
            start_command("web-api-not-a-file").unwrap(),
            Command::StartName {
                name: "web-api-not-a-file".to_string()
            }
        );
    }

    #[test]
    fn test_missing_config_file_is_a_config_error() {
        let err = start_command("/no/such/dir/apps.toml").unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_missing_config_does_not_launch_daemon() {
        let temp_dir = TempDir::new().unwrap();
        let settings = DaemonSettings::with_home(temp_dir.path());
        let missing = temp_dir.path().join("missing.json");
        let cli = Cli::try_parse_from(["warden", "start", missing.to_str().unwrap()]).unwrap();

        let err = cli.execute(DaemonManager::new(settings.clone())).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
        assert!(!settings.pid_path.exists());
        assert!(!settings.socket_path.exists());
        assert!(!settings.daemon_log.exists());
    }

    #[test]
    fn test_cli_parses_logs_flags() {
        let cli = Cli::try_parse_from(["warden", "logs", "web", "--lines", "40", "-f"]).unwrap();
        match cli.command {
            Commands::Logs {
                name,
                lines,
                follow,
            } => {
                assert_eq!(name, "web");
                assert_eq!(lines, 40);
                assert!(follow);
            }
            _ => panic!("Expected logs command"),
        }
    }

    #[test]
    fn test_list_is_an_alias_for_status() {
        let cli = Cli::try_parse_from(["warden", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }
}
