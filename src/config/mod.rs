// Config module - descriptor parsing and validation

mod settings;
mod spec;
pub mod units;

pub use settings::{DaemonSettings, HOME_ENV, SAMPLE_INTERVAL_ENV};
pub use spec::{
    CommandLine, LogPaths, ProcessSpec, RestartSettings, StopSignal, DEFAULT_KILL_TIMEOUT,
    DEFAULT_MAX_RESTARTS, DEFAULT_MAX_RESTART_DELAY, DEFAULT_MIN_RESTART_DELAY,
    DEFAULT_RESTART_WINDOW, DEFAULT_STABLE_AFTER,
};

use crate::error::{Result, WardenError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;
use units::{parse_duration, parse_memory, translate_date_format, Quantity, MAX_DURATION};

const MAX_INSTANCES: i64 = 100;

/// One app entry as written in a descriptor file, before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "command")]
    pub script: Option<String>,
    #[serde(default)]
    pub args: Option<Args>,
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, Scalar>,
    #[serde(default, alias = "output")]
    pub out_file: Option<PathBuf>,
    #[serde(default, alias = "error")]
    pub error_file: Option<PathBuf>,
    #[serde(default)]
    pub merge_logs: bool,
    #[serde(default)]
    pub log_date_format: Option<String>,
    #[serde(default)]
    pub autorestart: Option<bool>,
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub max_memory_restart: Option<Quantity>,
    #[serde(default)]
    pub instances: Option<i64>,
    #[serde(default)]
    pub exec_mode: Option<String>,
    #[serde(default)]
    pub restart_delay: Option<Quantity>,
    #[serde(default)]
    pub max_restart_delay: Option<Quantity>,
    #[serde(default)]
    pub min_uptime: Option<Quantity>,
    #[serde(default)]
    pub max_restarts: Option<usize>,
    #[serde(default)]
    pub restart_window: Option<Quantity>,
    #[serde(default)]
    pub kill_timeout: Option<Quantity>,
    #[serde(default, alias = "kill_signal")]
    pub stop_signal: Option<String>,
    /// Keys this supervisor does not understand; reported, never fatal
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// Arguments may be a whitespace-separated string or a list
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Args {
    Line(String),
    List(Vec<String>),
}

impl Args {
    fn into_vec(self) -> Vec<String> {
        match self {
            Args::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            Args::List(list) => list,
        }
    }
}

/// Environment values may be written as any scalar
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(s) => write!(f, "{}", s),
            Scalar::Integer(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// An entry that failed validation
#[derive(Debug)]
pub struct Rejection {
    pub name: String,
    pub error: WardenError,
}

/// Result of loading a descriptor file: valid specs plus per-entry rejections
#[derive(Debug)]
pub struct LoadedConfig {
    pub source: PathBuf,
    pub specs: Vec<ProcessSpec>,
    pub rejected: Vec<Rejection>,
}

/// Load a descriptor file (JSON or TOML).
///
/// Unreadable or malformed files fail as a whole. Each entry is then validated on
/// its own, so one bad entry never prevents the others from loading.
pub fn load(path: &Path, default_log_dir: &Path) -> Result<LoadedConfig> {
    let source = path.canonicalize().map_err(|e| {
        WardenError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let contents = std::fs::read_to_string(&source)
        .map_err(|e| WardenError::Config(format!("Failed to read config file: {}", e)))?;

    let extension = source.extension().and_then(|s| s.to_str()).unwrap_or("");
    let document: serde_json::Value = match extension {
        "json" => serde_json::from_str(&contents)
            .map_err(|e| WardenError::Config(format!("Failed to parse JSON: {}", e)))?,
        "toml" => toml::from_str(&contents)
            .map_err(|e| WardenError::Config(format!("Failed to parse TOML: {}", e)))?,
        _ => {
            return Err(WardenError::Config(format!(
                "Unsupported file format: '{}'. Use .json or .toml",
                extension
            )))
        }
    };
    let entries = split_entries(document)?;

    let base_dir = source
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut specs = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();

    for (idx, entry) in entries.into_iter().enumerate() {
        let label = entry
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("<entry {}>", idx + 1));

        if !seen.insert(label.clone()) {
            rejected.push(Rejection {
                error: WardenError::invalid(&label, "duplicate name in config file"),
                name: label,
            });
            continue;
        }

        let result = serde_json::from_value::<AppDescriptor>(entry)
            .map_err(|e| WardenError::invalid(&label, e.to_string()))
            .and_then(|descriptor| descriptor.into_spec(&base_dir, default_log_dir));
        match result {
            Ok(spec) => specs.push(spec),
            Err(error) => rejected.push(Rejection { name: label, error }),
        }
    }

    Ok(LoadedConfig {
        source,
        specs,
        rejected,
    })
}

/// Split a parsed file into raw entries: an `apps` or `processes` list, or one bare entry.
///
/// Entries stay untyped here so a malformed field only rejects its own entry.
fn split_entries(document: serde_json::Value) -> Result<Vec<serde_json::Value>> {
    let serde_json::Value::Object(mut root) = document else {
        return Err(WardenError::Config(
            "Config file must contain a table or object at the top level".to_string(),
        ));
    };

    let list = match root.remove("apps") {
        Some(apps) => Some(("apps", apps)),
        None => root.remove("processes").map(|p| ("processes", p)),
    };
    let entries = match list {
        Some((_, serde_json::Value::Array(items))) => items,
        Some((key, _)) => {
            return Err(WardenError::Config(format!("'{}' must be a list of entries", key)))
        }
        None if root.is_empty() => Vec::new(),
        None => vec![serde_json::Value::Object(root)],
    };

    if entries.is_empty() {
        return Err(WardenError::Config(
            "No process configuration found in file".to_string(),
        ));
    }
    Ok(entries)
}

impl AppDescriptor {
    /// Validate this entry and turn it into an immutable spec.
    ///
    /// Relative `cwd` resolves against `base_dir`; relative log paths resolve against the
    /// working directory.
    pub fn into_spec(self, base_dir: &Path, default_log_dir: &Path) -> Result<ProcessSpec> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| WardenError::MissingConfigField("name".to_string()))?
            .to_string();

        if name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(WardenError::invalid(
                &name,
                "name must not contain '/' or whitespace",
            ));
        }

        for key in self.unknown.keys() {
            warn!("Ignoring unsupported key '{}' in config for '{}'", key, name);
        }

        let script = self
            .script
            .as_deref()
            .map(expand_env)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| WardenError::invalid(&name, "script/command must not be empty"))?;

        let extra_args: Vec<String> = self
            .args
            .map(Args::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|a| expand_env(a))
            .collect();

        let command = match self
            .interpreter
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty() && *i != "none")
        {
            Some(interpreter) => {
                let mut args = vec![script];
                args.extend(extra_args);
                CommandLine {
                    program: PathBuf::from(expand_env(interpreter)),
                    args,
                }
            }
            None => CommandLine {
                program: PathBuf::from(script),
                args: extra_args,
            },
        };

        match self.exec_mode.as_deref().map(str::trim) {
            None | Some("fork") | Some("fork_mode") => {}
            Some("cluster") | Some("cluster_mode") => {
                return Err(WardenError::invalid(
                    &name,
                    "exec_mode 'cluster' is not supported, use 'fork'",
                ))
            }
            Some(other) => {
                return Err(WardenError::invalid(
                    &name,
                    format!("unknown exec_mode '{}'", other),
                ))
            }
        }

        if self.watch {
            return Err(WardenError::invalid(&name, "watch mode is not supported"));
        }

        let working_dir = match self.cwd {
            Some(cwd) => resolve(base_dir, &expand_env_path(&cwd)),
            None => base_dir.to_path_buf(),
        };
        if !working_dir.exists() {
            return Err(WardenError::invalid(
                &name,
                format!("working directory does not exist: {}", working_dir.display()),
            ));
        }
        if !working_dir.is_dir() {
            return Err(WardenError::invalid(
                &name,
                format!("working directory is not a directory: {}", working_dir.display()),
            ));
        }

        let instances = self.instances.unwrap_or(1);
        if instances < 1 {
            return Err(WardenError::invalid(&name, "instances must be at least 1"));
        }
        if instances > MAX_INSTANCES {
            return Err(WardenError::invalid(
                &name,
                format!("instances cannot exceed {}", MAX_INSTANCES),
            ));
        }

        let logs = LogPaths {
            stdout: self
                .out_file
                .map(|p| resolve(&working_dir, &expand_env_path(&p)))
                .unwrap_or_else(|| default_log_dir.join(format!("{}-out.log", name))),
            stderr: self
                .error_file
                .map(|p| resolve(&working_dir, &expand_env_path(&p)))
                .unwrap_or_else(|| default_log_dir.join(format!("{}-error.log", name))),
        };
        check_log_destination(&name, &logs.stdout, default_log_dir)?;
        check_log_destination(&name, &logs.stderr, default_log_dir)?;

        let log_date_format = self
            .log_date_format
            .as_deref()
            .map(translate_date_format)
            .transpose()
            .map_err(|e| WardenError::invalid(&name, e))?;

        let memory_limit_bytes = self
            .max_memory_restart
            .as_ref()
            .map(parse_memory)
            .transpose()
            .map_err(|e| WardenError::invalid(&name, e))?;
        if memory_limit_bytes == Some(0) {
            return Err(WardenError::invalid(
                &name,
                "max_memory_restart must be greater than zero",
            ));
        }

        let duration = |key: &str, value: &Option<Quantity>, default| -> Result<_> {
            let parsed = value
                .as_ref()
                .map(parse_duration)
                .transpose()
                .map_err(|e| WardenError::invalid(&name, e))?
                .unwrap_or(default);
            if parsed > MAX_DURATION {
                return Err(WardenError::invalid(
                    &name,
                    format!("{} cannot exceed {:?}", key, MAX_DURATION),
                ));
            }
            Ok(parsed)
        };

        let restart = RestartSettings {
            min_delay: duration("restart_delay", &self.restart_delay, DEFAULT_MIN_RESTART_DELAY)?,
            max_delay: duration(
                "max_restart_delay",
                &self.max_restart_delay,
                DEFAULT_MAX_RESTART_DELAY,
            )?,
            stable_after: duration("min_uptime", &self.min_uptime, DEFAULT_STABLE_AFTER)?,
            max_restarts: self.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            window: duration("restart_window", &self.restart_window, DEFAULT_RESTART_WINDOW)?,
        };
        if restart.max_restarts == 0 {
            return Err(WardenError::invalid(&name, "max_restarts must be at least 1"));
        }
        if restart.min_delay > restart.max_delay {
            return Err(WardenError::invalid(
                &name,
                "restart_delay must not exceed max_restart_delay",
            ));
        }
        if restart.window.is_zero() {
            return Err(WardenError::invalid(&name, "restart_window must be greater than zero"));
        }

        let kill_timeout = duration("kill_timeout", &self.kill_timeout, DEFAULT_KILL_TIMEOUT)?;

        let stop_signal = match self.stop_signal.as_deref() {
            None => StopSignal::default(),
            Some(raw) => StopSignal::parse(raw).ok_or_else(|| {
                WardenError::invalid(
                    &name,
                    format!(
                        "invalid stop_signal '{}', must be one of: {}",
                        raw,
                        StopSignal::NAMES.join(", ")
                    ),
                )
            })?,
        };

        let mut env = BTreeMap::new();
        for (key, value) in self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(WardenError::invalid(
                    &name,
                    format!("invalid environment variable name '{}'", key),
                ));
            }
            env.insert(key, value.to_string());
        }

        Ok(ProcessSpec {
            name,
            command,
            working_dir,
            env,
            logs,
            merge_logs: self.merge_logs,
            log_date_format,
            autorestart: self.autorestart.unwrap_or(true),
            memory_limit_bytes,
            instances: instances as usize,
            restart,
            stop_signal,
            kill_timeout,
        })
    }
}

/// Log files may be created later, but their directory must exist now.
///
/// The supervisor's own default log directory is created on demand.
fn check_log_destination(name: &str, path: &Path, default_log_dir: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(WardenError::invalid(
            name,
            format!("log path is a directory: {}", path.display()),
        ));
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    if parent == default_log_dir {
        return Ok(());
    }
    if !parent.is_dir() {
        return Err(WardenError::invalid(
            name,
            format!("log directory does not exist: {}", parent.display()),
        ));
    }
    if let Ok(meta) = std::fs::metadata(parent) {
        if meta.permissions().readonly() {
            return Err(WardenError::invalid(
                name,
                format!("log directory is not writable: {}", parent.display()),
            ));
        }
    }
    Ok(())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    normalize(&joined)
}

/// Lexically drop `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn expand_env_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env(&path.to_string_lossy()))
}

/// Expand `$VAR` and `${VAR}` from the supervisor's environment; unknown variables stay as written
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (var, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(var).ok().filter(|_| !var.is_empty()) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}
