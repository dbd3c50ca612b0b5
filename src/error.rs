use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Invalid configuration for '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },

    #[error("Process already exists: {0}")]
    AlreadyExists(String),

    // Process-related errors
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to launch '{name}': {reason}")]
    Launch { name: String, reason: String },

    #[error("Process {name} did not exit within {grace_ms}ms")]
    ShutdownTimeout { name: String, grace_ms: u128 },

    #[error("Illegal transition for {instance}: {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: String,
        to: String,
    },

    #[error("Signal error: {0}")]
    Signal(String),

    // Log-related errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Failed to open log file {path}: {reason}")]
    LogFile { path: String, reason: String },

    // IPC-related errors
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    #[error("Daemon error: {0}")]
    Daemon(String),

    /// An error reported by the daemon over IPC
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("Supervisor is shutting down")]
    SupervisorGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error category, carried over IPC so the CLI can pick its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    NotFound,
    Launch,
    Internal,
}

impl ErrorKind {
    /// Process exit code the CLI uses for this category
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config | ErrorKind::Internal => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::Launch => 3,
        }
    }
}

impl WardenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::Config(_)
            | WardenError::MissingConfigField(_)
            | WardenError::InvalidEntry { .. }
            | WardenError::AlreadyExists(_) => ErrorKind::Config,
            WardenError::ProcessNotFound(_) | WardenError::DaemonNotRunning => ErrorKind::NotFound,
            WardenError::Launch { .. } => ErrorKind::Launch,
            WardenError::Remote { kind, .. } => *kind,
            _ => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub(crate) fn launch(name: &str, reason: impl Into<String>) -> Self {
        WardenError::Launch {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        WardenError::InvalidEntry {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(WardenError::Config("bad".into()).exit_code(), 1);
        assert_eq!(WardenError::invalid("bot", "no cwd").exit_code(), 1);
        assert_eq!(WardenError::ProcessNotFound("bot".into()).exit_code(), 2);
        assert_eq!(WardenError::launch("bot", "missing").exit_code(), 3);
        assert_eq!(WardenError::Ipc("broken pipe".into()).exit_code(), 1);
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let err = WardenError::Remote {
            kind: ErrorKind::Launch,
            message: "Failed to launch 'bot'".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert_eq!(err.to_string(), "Failed to launch 'bot'");
    }
}
