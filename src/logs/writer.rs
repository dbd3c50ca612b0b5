use crate::config::LogPaths;
use crate::error::{Result, WardenError};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Which pipe a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn tag(self) -> &'static str {
        match self {
            StreamKind::Stdout => "[OUT]",
            StreamKind::Stderr => "[ERR]",
        }
    }
}

/// Append-only destination for one instance's captured output.
///
/// In split mode without a date format bytes are written verbatim. Otherwise every line
/// gets its prefixes and a trailing newline. Merged mode sends both streams to the stdout
/// file, tagging each line with a sequence number and its stream.
pub struct LogSink {
    stdout_path: PathBuf,
    stdout_file: Option<TokioFile>,
    /// Unused in merged mode
    stderr_file: Option<TokioFile>,
    merge: bool,
    date_format: Option<String>,
    sequence: u64,
    closed: bool,
}

impl LogSink {
    /// Open both destinations in append mode, creating missing parent directories
    ///
    /// # Arguments
    /// * `paths` - Stdout and stderr destinations
    /// * `merge` - Write both streams into the stdout destination with tags
    /// * `date_format` - chrono format for a per-line `[<date>] ` prefix
    pub async fn open(paths: &LogPaths, merge: bool, date_format: Option<String>) -> Result<Self> {
        let stdout_file = open_append(&paths.stdout).await?;
        let stderr_file = if merge {
            None
        } else {
            Some(open_append(&paths.stderr).await?)
        };

        Ok(Self {
            stdout_path: paths.stdout.clone(),
            stdout_file: Some(stdout_file),
            stderr_file,
            merge,
            date_format,
            sequence: 0,
            closed: false,
        })
    }

    /// Append `data` from `stream`
    pub async fn write(&mut self, stream: StreamKind, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(WardenError::Log(format!(
                "write to closed log sink {}",
                self.stdout_path.display()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let entry = self.format_entry(stream, data);

        let file = match (stream, self.merge) {
            (StreamKind::Stderr, false) => self.stderr_file.as_mut(),
            _ => self.stdout_file.as_mut(),
        }
        .ok_or_else(|| WardenError::Log("log destination missing".to_string()))?;

        file.write_all(&entry)
            .await
            .map_err(|e| WardenError::Log(format!("Failed to write to log: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| WardenError::Log(format!("Failed to flush log: {}", e)))?;

        Ok(())
    }

    fn format_entry(&mut self, stream: StreamKind, data: &[u8]) -> Vec<u8> {
        if !self.merge && self.date_format.is_none() {
            return data.to_vec();
        }

        let date = self
            .date_format
            .as_deref()
            .map(|fmt| Local::now().format(fmt).to_string());

        let mut entry = Vec::with_capacity(data.len() + 48);
        for line in data.split_inclusive(|b| *b == b'\n') {
            if let Some(ref date) = date {
                entry.push(b'[');
                entry.extend_from_slice(date.as_bytes());
                entry.extend_from_slice(b"] ");
            }
            if self.merge {
                self.sequence += 1;
                entry.extend_from_slice(format!("[#{}] {} ", self.sequence, stream.tag()).as_bytes());
            }
            entry.extend_from_slice(line);
            if !line.ends_with(b"\n") {
                entry.push(b'\n');
            }
        }
        entry
    }

    /// Flush both destinations
    pub async fn flush(&mut self) -> Result<()> {
        for file in [self.stdout_file.as_mut(), self.stderr_file.as_mut()]
            .into_iter()
            .flatten()
        {
            file.flush()
                .await
                .map_err(|e| WardenError::Log(format!("Failed to flush log: {}", e)))?;
        }
        Ok(())
    }

    /// Flush, sync and release both file handles. Later writes fail.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush().await?;
        for file in [self.stdout_file.take(), self.stderr_file.take()]
            .into_iter()
            .flatten()
        {
            file.sync_all()
                .await
                .map_err(|e| WardenError::Log(format!("Failed to sync log: {}", e)))?;
        }
        self.closed = true;
        Ok(())
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of tagged lines written so far (merged mode only)
    #[cfg(test)]
    fn sequence(&self) -> u64 {
        self.sequence
    }
}

async fn open_append(path: &Path) -> Result<TokioFile> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WardenError::LogFile {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| WardenError::LogFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    Ok(TokioFile::from_std(file))
}
