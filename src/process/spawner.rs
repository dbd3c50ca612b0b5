use crate::config::ProcessSpec;
use crate::error::{Result, WardenError};
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Handles returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle, killed if dropped
    pub child: Child,

    /// Process ID assigned by the OS
    pub pid: u32,

    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn one instance of `spec`
///
/// The child gets exactly the declared environment (nothing is inherited from the
/// supervisor), the declared working directory, a null stdin and piped stdout/stderr.
/// It leads its own process group so signals reach its descendants too.
/// A failure is reported once; retrying is the supervisor's decision.
///
/// # Arguments
/// * `spec` - Validated process specification
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Running child with its output pipes
/// * `Err(WardenError::Launch)` - The program could not be resolved or started
pub fn spawn(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    let program = resolve_program(spec)?;

    let mut command = Command::new(&program);
    command
        .args(&spec.command.args)
        .current_dir(&spec.working_dir)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| WardenError::launch(&spec.name, format!("{}: {}", program.display(), e)))?;

    let pid = child
        .id()
        .ok_or_else(|| WardenError::launch(&spec.name, "child exited before its pid was read"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WardenError::launch(&spec.name, "stdout pipe missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WardenError::launch(&spec.name, "stderr pipe missing"))?;

    Ok(SpawnedProcess {
        child,
        pid,
        stdout,
        stderr,
    })
}

/// Locate the executable for `spec`.
///
/// Paths with a `/` resolve against the working directory. Bare names are searched
/// in the declared `PATH`, falling back to the supervisor's own.
pub fn resolve_program(spec: &ProcessSpec) -> Result<PathBuf> {
    let program = &spec.command.program;

    if program.components().count() > 1 || program.is_absolute() {
        let candidate = if program.is_absolute() {
            program.clone()
        } else {
            spec.working_dir.join(program)
        };
        return check_executable(&spec.name, &candidate).map(|_| candidate);
    }

    let search_path: Option<OsString> = spec
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));

    if let Some(search_path) = search_path {
        for dir in std::env::split_paths(&search_path) {
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(WardenError::launch(
        &spec.name,
        format!("command not found in PATH: {}", program.display()),
    ))
}

fn check_executable(name: &str, path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| WardenError::launch(name, format!("{}: {}", path.display(), e)))?;

    if !metadata.is_file() {
        return Err(WardenError::launch(
            name,
            format!("not a regular file: {}", path.display()),
        ));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(WardenError::launch(
            name,
            format!("not executable: {}", path.display()),
        ));
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandLine, LogPaths, RestartSettings, StopSignal};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_test_spec(name: &str, program: &str, args: &[&str], cwd: &Path) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            command: CommandLine {
                program: PathBuf::from(program),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            working_dir: cwd.to_path_buf(),
            env: BTreeMap::new(),
            logs: LogPaths {
                stdout: cwd.join("out.log"),
                stderr: cwd.join("err.log"),
            },
            merge_logs: false,
            log_date_format: None,
            autorestart: true,
            memory_limit_bytes: None,
            instances: 1,
            restart: RestartSettings::default(),
            stop_signal: StopSignal::Term,
            kill_timeout: Duration::from_secs(5),
        }
    }

    async fn read_stdout(mut spawned: SpawnedProcess) -> String {
        let mut out = String::new();
        spawned.stdout.read_to_string(&mut out).await.unwrap();
        spawned.child.wait().await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec("echo", "/bin/echo", &["hello", "world"], temp_dir.path());

        let spawned = spawn(&spec).unwrap();
        assert!(spawned.pid > 0);
        assert_eq!(read_stdout(spawned).await, "hello world\n");
    }

    #[tokio::test]
    async fn test_spawn_uses_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec("pwd", "/bin/sh", &["-c", "pwd -P"], temp_dir.path());

        let out = read_stdout(spawn(&spec).unwrap()).await;
        let expected = temp_dir.path().canonicalize().unwrap();
        assert_eq!(out.trim(), expected.to_string_lossy());
    }

    #[tokio::test]
    async fn test_spawn_environment_is_exact() {
        std::env::set_var("WARDEN_SPAWNER_LEAK", "leaked");
        let temp_dir = TempDir::new().unwrap();
        let mut spec = create_test_spec(
            "env",
            "/bin/sh",
            &["-c", "echo \"$TEST_VAR:${WARDEN_SPAWNER_LEAK:-none}\""],
            temp_dir.path(),
        );
        spec.env
            .insert("TEST_VAR".to_string(), "test_value".to_string());

        let out = read_stdout(spawn(&spec).unwrap()).await;
        assert_eq!(out.trim(), "test_value:none");
    }

    #[tokio::test]
    async fn test_bare_name_uses_supervisor_path() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec("sh", "sh", &["-c", "exit 0"], temp_dir.path());
        let resolved = resolve_program(&spec).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_relative_program_resolves_against_cwd() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = create_test_spec("run", "./run.sh", &[], temp_dir.path());
        assert_eq!(resolve_program(&spec).unwrap(), temp_dir.path().join("./run.sh"));
    }

    #[test]
    fn test_nonexistent_program_is_launch_error() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec("missing", "/nonexistent/script", &[], temp_dir.path());

        match spawn(&spec) {
            Err(WardenError::Launch { name, .. }) => assert_eq!(name, "missing"),
            other => panic!("Expected launch error, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[test]
    fn test_non_executable_program_is_launch_error() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("plain.txt");
        std::fs::write(&script, "not a program").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        let spec = create_test_spec("plain", script.to_str().unwrap(), &[], temp_dir.path());
        let err = resolve_program(&spec).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn test_unknown_bare_name() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec("ghost", "warden-no-such-binary", &[], temp_dir.path());
        assert!(matches!(
            resolve_program(&spec),
            Err(WardenError::Launch { .. })
        ));
    }
}
