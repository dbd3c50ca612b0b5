// IPC Protocol definitions for client-daemon communication

use crate::config::LogPaths;
use crate::error::{ErrorKind, WardenError};
use crate::process::Status;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All available commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Load a descriptor file and start its entries
    StartFile { path: PathBuf },
    /// Start the stopped instances of an already loaded entry
    StartName { name: String },
    Stop { name: String },
    Restart { name: String },
    Delete { name: String },
    Status,
    /// Log destinations of an entry; the client reads the files itself
    Logs { name: String },
    /// Stop every process and shut the daemon down
    Kill,
    Ping,
}

/// Snapshot of one instance for status output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub index: usize,
    pub status: Status,
    pub pid: Option<u32>,
    pub restarts: u64,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub last_exit_code: Option<i32>,
    pub last_fault: Option<String>,
    pub command: String,
}

/// A descriptor entry that was rejected or failed to launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryError {
    pub name: String,
    pub message: String,
}

/// Outcome of `StartFile`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartReport {
    pub started: Vec<InstanceInfo>,
    pub rejected: Vec<EntryError>,
    pub launch_failures: Vec<EntryError>,
}

impl StartReport {
    /// Exit code for the CLI: invalid entries win over launch failures
    pub fn exit_code(&self) -> i32 {
        if !self.rejected.is_empty() {
            ErrorKind::Config.exit_code()
        } else if !self.launch_failures.is_empty() {
            ErrorKind::Launch.exit_code()
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLogs {
    pub index: usize,
    pub paths: LogPaths,
    pub merged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogReport {
    pub name: String,
    pub instances: Vec<InstanceLogs>,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Started(StartReport),
    /// Instances affected by the command, or all of them for `Status`
    Instances(Vec<InstanceInfo>),
    Logs(LogReport),
    ShuttingDown,
    Pong { pid: u32 },
}

/// Error carried back to the client with enough detail to pick an exit code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&WardenError> for ErrorReply {
    fn from(err: &WardenError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorReply> for WardenError {
    fn from(reply: ErrorReply) -> Self {
        WardenError::Remote {
            kind: reply.kind,
            message: reply.message,
        }
    }
}

/// Request message from client to daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from daemon to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, ErrorReply>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: &WardenError) -> Self {
        Self {
            id,
            result: Err(ErrorReply::from(error)),
        }
    }
}
