use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::process::restart::RestartTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Stopped,
    Starting,
    Running,
    Restarting,
    FailedPermanently,
}

impl Status {
    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Restarting)
                | (Starting, Stopped)
                | (Starting, FailedPermanently)
                | (Running, Stopped)
                | (Running, Restarting)
                | (Running, FailedPermanently)
                | (Restarting, Starting)
                | (Restarting, Stopped)
                | (FailedPermanently, Starting)
                | (FailedPermanently, Stopped)
        )
    }

    /// A child process may be alive in this state
    pub fn is_active(self) -> bool {
        matches!(self, Status::Starting | Status::Running | Status::Restarting)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Stopped => write!(f, "stopped"),
            Status::Starting => write!(f, "starting"),
            Status::Running => write!(f, "running"),
            Status::Restarting => write!(f, "restarting"),
            Status::FailedPermanently => write!(f, "failed"),
        }
    }
}

/// Identity of one instance of a configured entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub name: String,
    pub index: usize,
}

impl InstanceId {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.name, self.index)
    }
}

/// Why an instance last left the Running or Starting state involuntarily
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeFault {
    /// The child exited; `code` is `128 + signal` when it was killed by a signal
    Exited { code: i32, signal: Option<i32> },
    /// Resident memory went over the configured limit
    MemoryLimit { rss_bytes: u64, limit_bytes: u64 },
    /// The OS refused to start the child
    Launch { reason: String },
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeFault::Exited {
                signal: Some(sig), ..
            } => write!(f, "killed by signal {}", sig),
            RuntimeFault::Exited { code, .. } => write!(f, "exited with code {}", code),
            RuntimeFault::MemoryLimit {
                rss_bytes,
                limit_bytes,
            } => write!(
                f,
                "memory limit exceeded ({} > {} bytes)",
                rss_bytes, limit_bytes
            ),
            RuntimeFault::Launch { reason } => write!(f, "launch failed: {}", reason),
        }
    }
}

/// Emitted for every applied state change
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEvent {
    pub instance: InstanceId,
    pub from: Status,
    pub to: Status,
    pub at: SystemTime,
}

/// In-memory record of one managed instance
#[derive(Debug)]
pub struct RuntimeState {
    pub id: InstanceId,
    pub spec: Arc<ProcessSpec>,
    pub status: Status,
    pub pid: Option<u32>,
    /// Never decremented while the supervisor runs
    pub restart_count: u64,
    pub last_exit_code: Option<i32>,
    pub last_start_time: Option<SystemTime>,
    pub last_fault: Option<RuntimeFault>,
    pub memory_bytes: Option<u64>,
    pub tracker: RestartTracker,
    started_at: Option<Instant>,
}

impl RuntimeState {
    pub fn new(spec: Arc<ProcessSpec>, index: usize) -> Self {
        Self {
            id: InstanceId::new(spec.name.clone(), index),
            spec,
            status: Status::Stopped,
            pid: None,
            restart_count: 0,
            last_exit_code: None,
            last_start_time: None,
            last_fault: None,
            memory_bytes: None,
            tracker: RestartTracker::new(),
            started_at: None,
        }
    }

    /// Apply a state change, rejecting edges the state machine does not allow
    pub fn transition(&mut self, to: Status) -> Result<TransitionEvent> {
        if !self.status.can_transition_to(to) {
            return Err(WardenError::InvalidTransition {
                instance: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let from = self.status;
        self.status = to;
        Ok(TransitionEvent {
            instance: self.id.clone(),
            from,
            to,
            at: SystemTime::now(),
        })
    }

    pub fn mark_started(&mut self, pid: u32, now: Instant) {
        self.pid = Some(pid);
        self.started_at = Some(now);
        self.last_start_time = Some(SystemTime::now());
        self.memory_bytes = None;
    }

    /// Record the end of a run; returns how long it lasted
    pub fn mark_exited(&mut self, fault: Option<RuntimeFault>, now: Instant) -> Option<Duration> {
        if let Some(RuntimeFault::Exited { code, .. }) = &fault {
            self.last_exit_code = Some(*code);
        }
        if fault.is_some() {
            self.last_fault = fault;
        }
        self.pid = None;
        self.memory_bytes = None;
        self.started_at
            .take()
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn uptime(&self, now: Instant) -> Option<Duration> {
        self.started_at
            .map(|started| now.saturating_duration_since(started))
    }
}
