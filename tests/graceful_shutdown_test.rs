use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::oneshot;
use warden::config::{CommandLine, DaemonSettings, LogPaths, ProcessSpec, RestartSettings, StopSignal};
use warden::process::{Status, Supervisor};

fn create_test_spec(dir: &Path, name: &str, script: &str) -> ProcessSpec {
    ProcessSpec {
        name: name.to_string(),
        command: CommandLine {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        },
        working_dir: dir.to_path_buf(),
        env: BTreeMap::new(),
        logs: LogPaths {
            stdout: dir.join(format!("{}-out.log", name)),
            stderr: dir.join(format!("{}-error.log", name)),
        },
        merge_logs: false,
        log_date_format: None,
        autorestart: true,
        memory_limit_bytes: None,
        instances: 1,
        restart: RestartSettings::default(),
        stop_signal: StopSignal::Term,
        kill_timeout: Duration::from_secs(3),
    }
}

#[tokio::test]
async fn test_shutdown_stops_two_running_instances() {
    let temp_dir = TempDir::new().unwrap();
    let settings = DaemonSettings::with_home(temp_dir.path());
    let (supervisor, handle) = Supervisor::new(&settings);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(supervisor.run(async {
        let _ = stop_rx.await;
    }));

    let web = create_test_spec(temp_dir.path(), "web", "echo web up; sleep 30");
    let worker = create_test_spec(temp_dir.path(), "worker", "echo worker up; sleep 30");
    let web_log = web.logs.stdout.clone();
    let worker_log = worker.logs.stdout.clone();
    let report = handle.start(vec![web, worker]).await.unwrap();
    assert_eq!(report.started.len(), 2);

    let mut events = handle.subscribe();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let mut stopped = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!((event.from, event.to), (Status::Running, Status::Stopped));
        stopped.push(event.instance.name);
    }
    stopped.sort();
    assert_eq!(stopped, vec!["web".to_string(), "worker".to_string()]);

    // Sinks were flushed and closed before the loop returned
    assert_eq!(std::fs::read_to_string(web_log).unwrap(), "web up\n");
    assert_eq!(std::fs::read_to_string(worker_log).unwrap(), "worker up\n");
}

#[tokio::test]
async fn test_stubborn_child_is_killed_after_grace() {
    let temp_dir = TempDir::new().unwrap();
    let settings = DaemonSettings::with_home(temp_dir.path());
    let (supervisor, handle) = Supervisor::new(&settings);
    let task = tokio::spawn(supervisor.run(std::future::pending()));

    let mut spec = create_test_spec(
        temp_dir.path(),
        "stubborn",
        "trap '' TERM; while true; do sleep 0.1; done",
    );
    spec.kill_timeout = Duration::from_millis(400);
    handle.start(vec![spec]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let stopped = handle.stop("stubborn").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(stopped[0].status, Status::Stopped);
    assert_eq!(stopped[0].last_exit_code, Some(137));
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_secs(5));

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_custom_stop_signal_is_used() {
    let temp_dir = TempDir::new().unwrap();
    let settings = DaemonSettings::with_home(temp_dir.path());
    let (supervisor, handle) = Supervisor::new(&settings);
    let task = tokio::spawn(supervisor.run(std::future::pending()));

    let mut spec = create_test_spec(
        temp_dir.path(),
        "graceful",
        "trap 'echo got INT; exit 0' INT; trap '' TERM; while true; do sleep 0.1; done",
    );
    spec.stop_signal = StopSignal::Int;
    let log = spec.logs.stdout.clone();
    handle.start(vec![spec]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stopped = handle.stop("graceful").await.unwrap();
    assert_eq!(stopped[0].last_exit_code, Some(0));

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(log).unwrap(), "got INT\n");
}
