use crate::config::LogPaths;
use crate::error::{Result, WardenError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Which destination a line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Merged destination; lines already carry their own stream tags
    Merged,
}

/// A line read back from a log destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub source: LogSource,
    pub message: String,
}

impl LogEntry {
    /// Format the entry for display, labelling split destinations
    pub fn format(&self) -> String {
        match self.source {
            LogSource::Stdout => format!("[OUT] {}", self.message),
            LogSource::Stderr => format!("[ERR] {}", self.message),
            LogSource::Merged => self.message.clone(),
        }
    }
}

/// Read the last `lines` lines of a file; a missing file reads as empty
pub async fn read_tail(path: &Path, lines: usize) -> Result<Vec<String>> {
    if lines == 0 || !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).await.map_err(|e| WardenError::LogFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let mut tail = VecDeque::with_capacity(lines.min(4096));
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| WardenError::Log(format!("Failed to read log line: {}", e)))?;
        if n == 0 {
            break;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(decode_line(&buf));
    }

    Ok(tail.into_iter().collect())
}

/// Read the last `lines` lines of an instance's destinations.
///
/// Merged destinations come back as-is; split destinations yield stdout lines
/// followed by stderr lines.
pub async fn read_logs(paths: &LogPaths, merged: bool, lines: usize) -> Result<Vec<LogEntry>> {
    if merged {
        return Ok(read_tail(&paths.stdout, lines)
            .await?
            .into_iter()
            .map(|message| LogEntry {
                source: LogSource::Merged,
                message,
            })
            .collect());
    }

    let mut entries = Vec::new();
    for (path, source) in [
        (&paths.stdout, LogSource::Stdout),
        (&paths.stderr, LogSource::Stderr),
    ] {
        entries.extend(
            read_tail(path, lines)
                .await?
                .into_iter()
                .map(|message| LogEntry { source, message }),
        );
    }
    Ok(entries)
}

fn decode_line(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Streams lines appended to log destinations after it was created
pub struct LogFollower {
    receiver: mpsc::Receiver<LogEntry>,
    _task_handle: tokio::task::JoinHandle<()>,
}

impl LogFollower {
    pub async fn new(paths: &LogPaths, merged: bool) -> Self {
        let mut tailers = vec![if merged {
            FileTailer::at_end(paths.stdout.clone(), LogSource::Merged).await
        } else {
            FileTailer::at_end(paths.stdout.clone(), LogSource::Stdout).await
        }];
        if !merged {
            tailers.push(FileTailer::at_end(paths.stderr.clone(), LogSource::Stderr).await);
        }

        let (tx, rx) = mpsc::channel(256);
        let task_handle = tokio::spawn(async move {
            loop {
                let mut has_data = false;
                for tailer in tailers.iter_mut() {
                    while let Ok(Some(entry)) = tailer.read_next().await {
                        if tx.send(entry).await.is_err() {
                            return;
                        }
                        has_data = true;
                    }
                }
                if !has_data {
                    sleep(FOLLOW_POLL_INTERVAL).await;
                }
            }
        });

        Self {
            receiver: rx,
            _task_handle: task_handle,
        }
    }

    /// Wait for the next appended line
    pub async fn next(&mut self) -> Option<LogEntry> {
        self.receiver.recv().await
    }
}

/// Polls one file for complete appended lines
struct FileTailer {
    path: PathBuf,
    source: LogSource,
    reader: Option<BufReader<File>>,
    position: u64,
    partial: Vec<u8>,
}

impl FileTailer {
    async fn at_end(path: PathBuf, source: LogSource) -> Self {
        let position = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            path,
            source,
            reader: None,
            position,
            partial: Vec::new(),
        }
    }

    async fn read_next(&mut self) -> Result<Option<LogEntry>> {
        if self.reader.is_none() {
            if !self.path.exists() {
                return Ok(None);
            }
            let file = File::open(&self.path).await.map_err(|e| WardenError::LogFile {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
            let mut reader = BufReader::new(file);
            reader
                .seek(std::io::SeekFrom::Start(self.position))
                .await
                .map_err(|e| WardenError::Log(format!("Failed to seek in log file: {}", e)))?;
            self.reader = Some(reader);
        }

        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        match reader.read_until(b'\n', &mut self.partial).await {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.position += n as u64;
                if !self.partial.ends_with(b"\n") {
                    // Incomplete line; keep it until the rest arrives
                    return Ok(None);
                }
                let message = decode_line(&self.partial);
                self.partial.clear();
                Ok(Some(LogEntry {
                    source: self.source,
                    message,
                }))
            }
            Err(e) => {
                self.reader = None;
                Err(WardenError::Log(format!("Failed to read log line: {}", e)))
            }
        }
    }
}
