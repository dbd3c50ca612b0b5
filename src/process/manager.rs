use crate::config::units::deadline_after;
use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use crate::ipc::protocol::{InstanceInfo, InstanceLogs, LogReport};
use crate::logs::LogCapture;
use crate::process::monitor::{exceeds_limit, ResourceMonitor};
use crate::process::restart::RestartDecision;
use crate::process::spawner::spawn;
use crate::process::types::{InstanceId, RuntimeFault, RuntimeState, Status, TransitionEvent};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Bound on draining a capture once its children are gone
const CAPTURE_CLOSE_GRACE: Duration = Duration::from_secs(2);
/// Bound on reaping a child after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);
const EVENT_CAPACITY: usize = 256;

struct ManagedInstance {
    state: RuntimeState,
    child: Option<Child>,
    capture: LogCapture,
    restart_at: Option<Instant>,
}

/// Owner of the RuntimeState table.
///
/// Only the supervisor task holds a `ProcessManager`, so nothing here is locked.
pub struct ProcessManager {
    instances: BTreeMap<InstanceId, ManagedInstance>,
    monitor: ResourceMonitor,
    events: broadcast::Sender<TransitionEvent>,
}

impl ProcessManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            instances: BTreeMap::new(),
            monitor: ResourceMonitor::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<TransitionEvent> {
        self.events.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.keys().any(|id| id.name == name)
    }

    fn ids_for(&self, name: &str) -> Result<Vec<InstanceId>> {
        let ids: Vec<InstanceId> = self
            .instances
            .keys()
            .filter(|id| id.name == name)
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(WardenError::ProcessNotFound(name.to_string()));
        }
        Ok(ids)
    }

    /// Add `spec.instances` Stopped instances and open their log captures
    pub async fn register(&mut self, spec: ProcessSpec) -> Result<Vec<InstanceId>> {
        if self.contains(&spec.name) {
            return Err(WardenError::AlreadyExists(spec.name.clone()));
        }

        let spec = Arc::new(spec);
        let mut created: Vec<ManagedInstance> = Vec::with_capacity(spec.instances);

        for index in 0..spec.instances {
            let state = RuntimeState::new(spec.clone(), index);
            let capture = LogCapture::open(
                state.id.to_string(),
                spec.log_paths_for(index),
                spec.merge_logs,
                spec.log_date_format.clone(),
            )
            .await;

            match capture {
                Ok(capture) => created.push(ManagedInstance {
                    state,
                    child: None,
                    capture,
                    restart_at: None,
                }),
                Err(e) => {
                    for mut instance in created {
                        let _ = instance.capture.close(CAPTURE_CLOSE_GRACE).await;
                    }
                    return Err(WardenError::invalid(&spec.name, e.to_string()));
                }
            }
        }

        let ids = created.iter().map(|i| i.state.id.clone()).collect();
        for instance in created {
            self.instances.insert(instance.state.id.clone(), instance);
        }
        Ok(ids)
    }

    /// Start one instance.
    ///
    /// # Returns
    /// The child's pid, or the launch error after the instance has been moved along
    /// the fault path (Restarting, Stopped or FailedPermanently).
    pub fn launch(&mut self, id: &InstanceId, now: Instant) -> Result<u32> {
        let events = self.events.clone();
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| WardenError::ProcessNotFound(id.to_string()))?;

        apply(&events, &mut instance.state, Status::Starting)?;
        instance.restart_at = None;

        match spawn(&instance.state.spec) {
            Ok(spawned) => {
                let pid = spawned.pid;
                if let Err(e) = instance.capture.attach(spawned.stdout, spawned.stderr) {
                    warn!("Output of {} will not be captured: {}", id, e);
                }
                instance.child = Some(spawned.child);
                instance.state.mark_started(pid, now.into_std());
                apply(&events, &mut instance.state, Status::Running)?;
                info!("Started {} (pid {})", id, pid);
                Ok(pid)
            }
            Err(e) => {
                warn!("{}", e);
                let reason = match &e {
                    WardenError::Launch { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                self.on_fault(id, RuntimeFault::Launch { reason }, None, now);
                Err(e)
            }
        }
    }

    /// Launch every instance of a freshly registered entry
    pub fn launch_all(&mut self, ids: &[InstanceId], now: Instant) -> Vec<(InstanceId, WardenError)> {
        ids.iter()
            .filter_map(|id| self.launch(id, now).err().map(|e| (id.clone(), e)))
            .collect()
    }

    /// Decide what follows a fault: Stopped, Restarting with a backoff, or FailedPermanently
    fn on_fault(
        &mut self,
        id: &InstanceId,
        fault: RuntimeFault,
        uptime: Option<Duration>,
        now: Instant,
    ) {
        let events = self.events.clone();
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };

        let memory_breach = matches!(fault, RuntimeFault::MemoryLimit { .. });
        instance.state.last_fault = Some(fault.clone());

        if !instance.state.spec.autorestart && !memory_breach {
            info!("{} {}; autorestart is off", id, fault);
            if let Err(e) = apply(&events, &mut instance.state, Status::Stopped) {
                error!("{}", e);
            }
            return;
        }

        let settings = instance.state.spec.restart;
        match instance.state.tracker.decide(&settings, uptime, now.into_std()) {
            RestartDecision::Restart { delay } => {
                instance.state.restart_count += 1;
                instance.restart_at = Some(deadline_after(now, delay));
                info!(
                    "{} {}; restarting in {:?} (restart #{})",
                    id, fault, delay, instance.state.restart_count
                );
                if let Err(e) = apply(&events, &mut instance.state, Status::Restarting) {
                    error!("{}", e);
                }
            }
            RestartDecision::GiveUp { restarts_in_window } => {
                instance.restart_at = None;
                error!(
                    instance = %id,
                    "{} failed permanently: {} restarts within {:?}, last fault: {}",
                    id, restarts_in_window, settings.window, fault
                );
                if let Err(e) = apply(&events, &mut instance.state, Status::FailedPermanently) {
                    error!("{}", e);
                }
            }
        }
    }

    /// Collect exited children without blocking
    ///
    /// # Returns
    /// Number of exits observed
    pub fn reap(&mut self, now: Instant) -> usize {
        let mut exited = Vec::new();
        for (id, instance) in self.instances.iter_mut() {
            let Some(child) = instance.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    instance.child = None;
                    exited.push((id.clone(), status));
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll {}: {}", id, e),
            }
        }

        let count = exited.len();
        for (id, status) in exited {
            self.on_exit(&id, status, now);
        }
        count
    }

    fn on_exit(&mut self, id: &InstanceId, status: ExitStatus, now: Instant) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        let fault = exit_fault(status);
        if let Some(pid) = instance.state.pid {
            self.monitor.forget(pid);
        }
        let uptime = instance.state.mark_exited(Some(fault.clone()), now.into_std());
        debug!("{} {} after {:?}", id, fault, uptime.unwrap_or_default());
        self.on_fault(id, fault, uptime, now);
    }

    /// Sample memory of every Running instance and kill those over their limit
    pub async fn sample_memory(&mut self, now: Instant) {
        let mut breaches = Vec::new();
        for (id, instance) in self.instances.iter_mut() {
            if instance.state.status != Status::Running {
                continue;
            }
            let Some(pid) = instance.state.pid else {
                continue;
            };
            let Some(rss) = self.monitor.sample(pid) else {
                continue;
            };
            instance.state.memory_bytes = Some(rss);
            if exceeds_limit(rss, instance.state.spec.memory_limit_bytes) {
                breaches.push((id.clone(), rss));
            }
        }

        for (id, rss) in breaches {
            self.enforce_memory_limit(&id, rss, now).await;
        }
    }

    async fn enforce_memory_limit(&mut self, id: &InstanceId, rss: u64, now: Instant) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        let Some(mut child) = instance.child.take() else {
            return;
        };

        let limit = instance.state.spec.memory_limit_bytes.unwrap_or_default();
        warn!(
            "{} exceeded memory limit: {} bytes (limit: {} bytes), killing",
            id, rss, limit
        );

        if let Some(pid) = instance.state.pid {
            let _ = signal_group(pid, Signal::SIGKILL);
        }
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill {}: {}", id, e);
        }
        let status = timeout(KILL_WAIT, child.wait()).await;

        if let Some(pid) = instance.state.pid {
            self.monitor.forget(pid);
        }
        let fault = RuntimeFault::MemoryLimit {
            rss_bytes: rss,
            limit_bytes: limit,
        };
        let uptime = instance.state.mark_exited(Some(fault.clone()), now.into_std());
        if let Ok(Ok(status)) = status {
            instance.state.last_exit_code = Some(exit_code(status));
        }
        self.on_fault(id, fault, uptime, now);
    }

    /// Earliest pending restart
    pub fn next_restart_at(&self) -> Option<Instant> {
        self.instances
            .values()
            .filter(|i| i.state.status == Status::Restarting)
            .filter_map(|i| i.restart_at)
            .min()
    }

    /// Launch every instance whose backoff has elapsed
    pub fn launch_due(&mut self, now: Instant) {
        let due: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, i)| i.state.status == Status::Restarting)
            .filter(|(_, i)| i.restart_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            // Failures are already logged and routed through the fault path
            let _ = self.launch(&id, now);
        }
    }

    /// Stop signal, then the grace period measured from one shared start, then SIGKILL.
    ///
    /// Statuses are left untouched; callers settle them afterwards.
    async fn terminate(&mut self, ids: &[InstanceId]) {
        let started = Instant::now();

        for id in ids {
            let Some(instance) = self.instances.get(id) else {
                continue;
            };
            if let (Some(_), Some(pid)) = (instance.child.as_ref(), instance.state.pid) {
                let sig = instance.state.spec.stop_signal;
                debug!("Sending {} to {} (pid {})", sig, id, pid);
                if let Err(e) = signal_group(pid, sig.as_nix()) {
                    debug!("Could not signal {}: {}", id, e);
                }
            }
        }

        for id in ids {
            let Some(instance) = self.instances.get_mut(id) else {
                continue;
            };
            let Some(mut child) = instance.child.take() else {
                continue;
            };

            let grace = instance.state.spec.kill_timeout;
            let status = match timeout_at(deadline_after(started, grace), child.wait()).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    warn!("Failed to wait for {}: {}", id, e);
                    None
                }
                Err(_) => {
                    let err = WardenError::ShutdownTimeout {
                        name: id.to_string(),
                        grace_ms: grace.as_millis(),
                    };
                    warn!("{}, sending SIGKILL", err);
                    if let Some(pid) = instance.state.pid {
                        let _ = signal_group(pid, Signal::SIGKILL);
                    }
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill {}: {}", id, e);
                    }
                    timeout(KILL_WAIT, child.wait()).await.ok().and_then(|r| r.ok())
                }
            };

            if let Some(pid) = instance.state.pid {
                self.monitor.forget(pid);
            }
            instance.state.mark_exited(None, Instant::now().into_std());
            if let Some(status) = status {
                instance.state.last_exit_code = Some(exit_code(status));
            }
            info!("Stopped {}", id);
        }
    }

    fn settle_stopped(&mut self, id: &InstanceId) {
        let events = self.events.clone();
        if let Some(instance) = self.instances.get_mut(id) {
            instance.restart_at = None;
            if instance.state.status != Status::Stopped {
                if let Err(e) = apply(&events, &mut instance.state, Status::Stopped) {
                    error!("{}", e);
                }
            }
        }
    }

    /// Start the Stopped or FailedPermanently instances of an existing entry
    pub fn start_existing(&mut self, name: &str, now: Instant) -> Result<Vec<InstanceInfo>> {
        let ids = self.ids_for(name)?;
        let mut first_error = None;

        for id in &ids {
            let Some(instance) = self.instances.get_mut(id) else {
                continue;
            };
            match instance.state.status {
                Status::Stopped => {}
                Status::FailedPermanently => instance.state.tracker.reset(),
                _ => continue,
            }
            if let Err(e) = self.launch(id, now) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.info_for(name)),
        }
    }

    /// Terminate all instances of `name` and leave them Stopped
    pub async fn stop(&mut self, name: &str) -> Result<Vec<InstanceInfo>> {
        let ids = self.ids_for(name)?;
        self.terminate(&ids).await;
        for id in &ids {
            self.settle_stopped(id);
        }
        Ok(self.info_for(name))
    }

    /// Terminate and start again; also the explicit reset out of FailedPermanently
    pub async fn restart(&mut self, name: &str) -> Result<Vec<InstanceInfo>> {
        let ids = self.ids_for(name)?;
        self.terminate(&ids).await;

        let events = self.events.clone();
        let mut first_error = None;
        for id in &ids {
            let Some(instance) = self.instances.get_mut(id) else {
                continue;
            };
            instance.restart_at = None;
            instance.state.tracker.reset();
            if instance.state.last_start_time.is_some() {
                instance.state.restart_count += 1;
            }
            if matches!(instance.state.status, Status::Running | Status::Starting) {
                if let Err(e) = apply(&events, &mut instance.state, Status::Restarting) {
                    error!("{}", e);
                }
            }
            if let Err(e) = self.launch(id, Instant::now()) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.info_for(name)),
        }
    }

    /// Stop all instances of `name`, release their logs and forget them
    pub async fn delete(&mut self, name: &str) -> Result<Vec<InstanceInfo>> {
        let ids = self.ids_for(name)?;
        self.terminate(&ids).await;
        for id in &ids {
            self.settle_stopped(id);
        }
        let info = self.info_for(name);

        for id in &ids {
            if let Some(mut instance) = self.instances.remove(id) {
                if let Err(e) = instance.capture.close(CAPTURE_CLOSE_GRACE).await {
                    warn!("Failed to close logs of {}: {}", id, e);
                }
            }
        }
        info!("Deleted {}", name);
        Ok(info)
    }

    /// Stop everything and close every log capture
    pub async fn shutdown(&mut self) {
        let ids: Vec<InstanceId> = self.instances.keys().cloned().collect();
        info!("Stopping {} instance(s)", ids.len());

        self.terminate(&ids).await;
        for id in &ids {
            self.settle_stopped(id);
        }

        for (id, instance) in self.instances.iter_mut() {
            if let Err(e) = instance.capture.close(CAPTURE_CLOSE_GRACE).await {
                warn!("Failed to close logs of {}: {}", id, e);
            }
        }
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        let now = std::time::Instant::now();
        self.instances
            .values()
            .map(|i| describe(&i.state, now))
            .collect()
    }

    fn info_for(&self, name: &str) -> Vec<InstanceInfo> {
        let now = std::time::Instant::now();
        self.instances
            .values()
            .filter(|i| i.state.id.name == name)
            .map(|i| describe(&i.state, now))
            .collect()
    }

    pub fn info(&self, id: &InstanceId) -> Option<InstanceInfo> {
        self.instances
            .get(id)
            .map(|i| describe(&i.state, std::time::Instant::now()))
    }

    /// Log destinations of every instance of `name`
    pub fn logs(&self, name: &str) -> Result<LogReport> {
        let instances: Vec<InstanceLogs> = self
            .instances
            .values()
            .filter(|i| i.state.id.name == name)
            .map(|i| InstanceLogs {
                index: i.state.id.index,
                paths: i.capture.paths().clone(),
                merged: i.capture.merged(),
            })
            .collect();

        if instances.is_empty() {
            return Err(WardenError::ProcessNotFound(name.to_string()));
        }
        Ok(LogReport {
            name: name.to_string(),
            instances,
        })
    }

    pub fn status_of(&self, id: &InstanceId) -> Option<Status> {
        self.instances.get(id).map(|i| i.state.status)
    }

    #[cfg(test)]
    pub fn all_captures_closed(&self) -> bool {
        self.instances.values().all(|i| i.capture.is_closed())
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(
    events: &broadcast::Sender<TransitionEvent>,
    state: &mut RuntimeState,
    to: Status,
) -> Result<()> {
    let event = state.transition(to)?;
    debug!("{}: {} -> {}", event.instance, event.from, event.to);
    // No subscribers is fine
    let _ = events.send(event);
    Ok(())
}

/// Signal the child's process group, falling back to the child alone
fn signal_group(pid: u32, sig: Signal) -> nix::Result<()> {
    let pid = Pid::from_raw(pid as i32);
    signal::killpg(pid, sig).or_else(|_| signal::kill(pid, sig))
}

/// Exit code, or `128 + signal` for a child killed by a signal
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn exit_fault(status: ExitStatus) -> RuntimeFault {
    RuntimeFault::Exited {
        code: exit_code(status),
        signal: status.signal(),
    }
}

fn describe(state: &RuntimeState, now: std::time::Instant) -> InstanceInfo {
    InstanceInfo {
        name: state.id.name.clone(),
        index: state.id.index,
        status: state.status,
        pid: state.pid,
        restarts: state.restart_count,
        uptime_secs: state
            .uptime(now)
            .filter(|_| state.status == Status::Running)
            .map(|d| d.as_secs()),
        memory_bytes: state.memory_bytes,
        memory_limit_bytes: state.spec.memory_limit_bytes,
        last_exit_code: state.last_exit_code,
        last_fault: state.last_fault.as_ref().map(ToString::to_string),
        command: state.spec.command.to_string(),
    }
}
