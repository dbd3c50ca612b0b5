// Daemon runtime - wires the IPC server to the supervisor loop

use super::manager::DaemonManager;
use crate::config::DaemonSettings;
use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, ResponseData};
use crate::ipc::server::IpcServer;
use crate::process::{Supervisor, SupervisorHandle};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The long-running daemon behind `wardend`
pub struct Daemon {
    settings: DaemonSettings,
}

impl Daemon {
    pub fn new(settings: DaemonSettings) -> Self {
        Self { settings }
    }

    /// Serve until SIGTERM, SIGINT or a `Kill` command, then stop every process.
    pub async fn run(self) -> Result<()> {
        self.settings.ensure_dirs()?;

        let manager = DaemonManager::new(self.settings.clone());
        manager.register_daemon()?;

        let result = self.serve().await;

        if let Err(e) = manager.unregister_daemon() {
            error!("{}", e);
        }
        result
    }

    async fn serve(&self) -> Result<()> {
        let server = IpcServer::bind(&self.settings.socket_path)?;
        info!(
            "wardend {} listening on {} (pid {})",
            env!("CARGO_PKG_VERSION"),
            server.socket_path().display(),
            std::process::id()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let signals = tokio::spawn(forward_signals(stop_tx.clone()));

        let (supervisor, handle) = Supervisor::new(&self.settings);
        let supervisor_task = tokio::spawn(supervisor.run(stopped(stop_rx)));

        let result = serve_until_stopped(&server, handle, supervisor_task, stop_tx).await;

        signals.abort();
        drop(server);
        info!("wardend stopped");
        result
    }
}

/// Answer IPC requests until a stop is requested or the supervisor task ends on its own.
///
/// An early end of the supervisor stops the server too, so the daemon exits instead of
/// answering every request with `SupervisorGone`.
async fn serve_until_stopped(
    server: &IpcServer,
    handle: SupervisorHandle,
    mut supervisor_task: JoinHandle<Result<()>>,
    stop_tx: watch::Sender<bool>,
) -> Result<()> {
    let stop_rx = stop_tx.subscribe();
    let handler_stop = stop_tx.clone();
    let serving = server.run(
        move |command| {
            let handle = handle.clone();
            let stop = handler_stop.clone();
            async move { handle_command(command, handle, stop).await }
        },
        stopped(stop_rx.clone()),
    );

    let mut served = Ok(());
    let finished = tokio::select! {
        result = serving => {
            served = result;
            None
        }
        finished = &mut supervisor_task => Some(finished),
    };

    let early_exit = finished.is_some() && !*stop_rx.borrow();
    if early_exit {
        error!("Supervisor loop ended while the daemon was serving, shutting down");
    }
    let _ = stop_tx.send(true);

    let finished = match finished {
        Some(finished) => finished,
        None => supervisor_task.await,
    };
    let supervised =
        finished.map_err(|e| WardenError::Daemon(format!("Supervisor task failed: {}", e)))?;

    if early_exit {
        supervised?;
        return Err(WardenError::Daemon(
            "Supervisor loop ended unexpectedly".to_string(),
        ));
    }
    served.and(supervised)
}

async fn handle_command(
    command: Command,
    handle: SupervisorHandle,
    stop: watch::Sender<bool>,
) -> Result<ResponseData> {
    match command {
        Command::StartFile { path } => handle.start_file(path).await.map(ResponseData::Started),
        Command::StartName { name } => handle.start_name(&name).await.map(ResponseData::Instances),
        Command::Stop { name } => handle.stop(&name).await.map(ResponseData::Instances),
        Command::Restart { name } => handle.restart(&name).await.map(ResponseData::Instances),
        Command::Delete { name } => handle.delete(&name).await.map(ResponseData::Instances),
        Command::Status => handle.status().await.map(ResponseData::Instances),
        Command::Logs { name } => handle.logs(&name).await.map(ResponseData::Logs),
        Command::Kill => {
            info!("Kill requested over IPC");
            let _ = stop.send(true);
            Ok(ResponseData::ShuttingDown)
        }
        Command::Ping => Ok(ResponseData::Pong {
            pid: std::process::id(),
        }),
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn forward_signals(stop: watch::Sender<bool>) {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    let _ = stop.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn bound_server(temp_dir: &TempDir) -> (DaemonSettings, IpcServer) {
        let settings = DaemonSettings::with_home(temp_dir.path());
        settings.ensure_dirs().unwrap();
        let server = IpcServer::bind(&settings.socket_path).unwrap();
        (settings, server)
    }

    #[tokio::test]
    async fn test_serving_ends_when_supervisor_panics() {
        let temp_dir = TempDir::new().unwrap();
        let (settings, server) = bound_server(&temp_dir);
        let (_supervisor, handle) = Supervisor::new(&settings);
        let (stop_tx, _) = watch::channel(false);

        let crashed: JoinHandle<Result<()>> = tokio::spawn(async { panic!("loop crashed") });
        let result = timeout(
            Duration::from_secs(5),
            serve_until_stopped(&server, handle, crashed, stop_tx),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(WardenError::Daemon(_))));
    }

    #[tokio::test]
    async fn test_serving_ends_when_supervisor_returns_early() {
        let temp_dir = TempDir::new().unwrap();
        let (settings, server) = bound_server(&temp_dir);
        let (supervisor, handle) = Supervisor::new(&settings);
        let (stop_tx, _) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(async {}));
        let result = timeout(
            Duration::from_secs(5),
            serve_until_stopped(&server, handle, task, stop_tx),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("ended unexpectedly"));
    }

    #[tokio::test]
    async fn test_requested_stop_is_clean() {
        let temp_dir = TempDir::new().unwrap();
        let (settings, server) = bound_server(&temp_dir);
        let (supervisor, handle) = Supervisor::new(&settings);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(stopped(stop_rx)));
        let trigger = stop_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = trigger.send(true);
        });

        let result = timeout(
            Duration::from_secs(5),
            serve_until_stopped(&server, handle, task, stop_tx),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
