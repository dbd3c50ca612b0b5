use crate::config::{self, DaemonSettings, ProcessSpec};
use crate::error::{Result, WardenError};
use crate::ipc::protocol::{EntryError, InstanceInfo, LogReport, StartReport};
use crate::process::manager::ProcessManager;
use crate::process::types::TransitionEvent;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Fallback for missed SIGCHLD deliveries
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Op {
    StartFile(PathBuf, Reply<StartReport>),
    StartSpecs(Vec<ProcessSpec>, Reply<StartReport>),
    StartName(String, Reply<Vec<InstanceInfo>>),
    Stop(String, Reply<Vec<InstanceInfo>>),
    Restart(String, Reply<Vec<InstanceInfo>>),
    Delete(String, Reply<Vec<InstanceInfo>>),
    Status(Reply<Vec<InstanceInfo>>),
    Logs(String, Reply<LogReport>),
    Shutdown(Reply<()>),
}

/// The supervisor loop: sole owner of every RuntimeState.
///
/// Commands arrive through a [`SupervisorHandle`]; child exits, memory samples and
/// restart deadlines are handled in the same task, in the order they are observed.
pub struct Supervisor {
    manager: ProcessManager,
    commands: mpsc::Receiver<Op>,
    log_dir: PathBuf,
    sample_interval: Duration,
}

/// Cloneable front end to a running [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Op>,
    events: broadcast::Sender<TransitionEvent>,
}

impl Supervisor {
    pub fn new(settings: &DaemonSettings) -> (Self, SupervisorHandle) {
        let manager = ProcessManager::new();
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SupervisorHandle {
            commands: tx,
            events: manager.event_sender(),
        };
        let supervisor = Self {
            manager,
            commands: rx,
            log_dir: settings.log_dir.clone(),
            sample_interval: settings.sample_interval,
        };
        (supervisor, handle)
    }

    /// Run until `shutdown` resolves, a `Shutdown` command arrives or every handle is gone.
    ///
    /// All children are stopped and all log sinks closed before this returns.
    pub async fn run<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut sigchld = match signal(SignalKind::child()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("SIGCHLD unavailable, polling for exits: {}", e);
                None
            }
        };

        let mut reap_tick = interval(REAP_INTERVAL);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sample_tick = interval(self.sample_interval);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Supervisor running (memory sampling every {:?})",
            self.sample_interval
        );

        loop {
            let next_restart = self.manager.next_restart_at();

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    self.manager.shutdown().await;
                    break;
                }
                op = self.commands.recv() => match op {
                    Some(Op::Shutdown(reply)) => {
                        self.manager.shutdown().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(op) => self.handle(op).await,
                    None => {
                        debug!("All supervisor handles dropped");
                        self.manager.shutdown().await;
                        break;
                    }
                },
                _ = child_exited(&mut sigchld) => {
                    self.manager.reap(Instant::now());
                }
                _ = reap_tick.tick() => {
                    self.manager.reap(Instant::now());
                }
                _ = sample_tick.tick() => {
                    self.manager.sample_memory(Instant::now()).await;
                }
                _ = restart_due(next_restart) => {
                    self.manager.launch_due(Instant::now());
                }
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }

    async fn handle(&mut self, op: Op) {
        match op {
            Op::StartFile(path, reply) => {
                let report = self.start_file(&path).await;
                let _ = reply.send(report);
            }
            Op::StartSpecs(specs, reply) => {
                let report = self.start_specs(specs, StartReport::default()).await;
                let _ = reply.send(Ok(report));
            }
            Op::StartName(name, reply) => {
                let _ = reply.send(self.manager.start_existing(&name, Instant::now()));
            }
            Op::Stop(name, reply) => {
                let _ = reply.send(self.manager.stop(&name).await);
            }
            Op::Restart(name, reply) => {
                let _ = reply.send(self.manager.restart(&name).await);
            }
            Op::Delete(name, reply) => {
                let _ = reply.send(self.manager.delete(&name).await);
            }
            Op::Status(reply) => {
                let _ = reply.send(Ok(self.manager.list()));
            }
            Op::Logs(name, reply) => {
                let _ = reply.send(self.manager.logs(&name));
            }
            // Handled by the loop itself
            Op::Shutdown(reply) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn start_file(&mut self, path: &std::path::Path) -> Result<StartReport> {
        let loaded = config::load(path, &self.log_dir)?;
        info!(
            "Loaded {} entr{} from {}",
            loaded.specs.len(),
            if loaded.specs.len() == 1 { "y" } else { "ies" },
            loaded.source.display()
        );

        let mut report = StartReport::default();
        for rejection in loaded.rejected {
            warn!("Skipping '{}': {}", rejection.name, rejection.error);
            report.rejected.push(EntryError {
                name: rejection.name,
                message: rejection.error.to_string(),
            });
        }

        Ok(self.start_specs(loaded.specs, report).await)
    }

    async fn start_specs(&mut self, specs: Vec<ProcessSpec>, mut report: StartReport) -> StartReport {
        for spec in specs {
            let name = spec.name.clone();
            let ids = match self.manager.register(spec).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Skipping '{}': {}", name, e);
                    report.rejected.push(EntryError {
                        name,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let failures = self.manager.launch_all(&ids, Instant::now());
            for id in &ids {
                match failures.iter().find(|(failed, _)| failed == id) {
                    Some((_, e)) => report.launch_failures.push(EntryError {
                        name: id.to_string(),
                        message: e.to_string(),
                    }),
                    None => report.started.extend(self.manager.info(id)),
                }
            }
        }
        report
    }
}

async fn child_exited(sigchld: &mut Option<Signal>) {
    match sigchld {
        Some(stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

async fn restart_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SupervisorHandle {
    async fn request<T>(&self, op: impl FnOnce(Reply<T>) -> Op) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(op(tx))
            .await
            .map_err(|_| WardenError::SupervisorGone)?;
        rx.await.map_err(|_| WardenError::SupervisorGone)?
    }

    /// Load a descriptor file and start every valid entry
    pub async fn start_file(&self, path: PathBuf) -> Result<StartReport> {
        self.request(|tx| Op::StartFile(path, tx)).await
    }

    /// Start already validated specs
    pub async fn start(&self, specs: Vec<ProcessSpec>) -> Result<StartReport> {
        self.request(|tx| Op::StartSpecs(specs, tx)).await
    }

    /// Start the stopped instances of a loaded entry
    pub async fn start_name(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        let name = name.to_string();
        self.request(|tx| Op::StartName(name, tx)).await
    }

    pub async fn stop(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        let name = name.to_string();
        self.request(|tx| Op::Stop(name, tx)).await
    }

    pub async fn restart(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        let name = name.to_string();
        self.request(|tx| Op::Restart(name, tx)).await
    }

    pub async fn delete(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        let name = name.to_string();
        self.request(|tx| Op::Delete(name, tx)).await
    }

    pub async fn status(&self) -> Result<Vec<InstanceInfo>> {
        self.request(Op::Status).await
    }

    pub async fn logs(&self, name: &str) -> Result<LogReport> {
        let name = name.to_string();
        self.request(|tx| Op::Logs(name, tx)).await
    }

    /// Stop every instance and end the loop; resolves once everything is stopped
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Op::Shutdown).await
    }

    /// Every state transition, as it happens
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }
}
