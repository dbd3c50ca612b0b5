use crate::config::units::deadline_after;
use crate::config::LogPaths;
use crate::error::{Result, WardenError};
use crate::logs::writer::{LogSink, StreamKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// One chunk read from a child pipe, normally a full line
#[derive(Debug)]
pub struct LogLine {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

/// Output capture for one instance across all of its restarts.
///
/// A single writer task owns the [`LogSink`]; each spawn adds two pump tasks that read
/// the child's pipes and forward lines over a channel. Pumps and the writer never touch
/// supervisor state.
pub struct LogCapture {
    label: String,
    paths: LogPaths,
    merged: bool,
    sender: Option<mpsc::Sender<LogLine>>,
    pumps: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl LogCapture {
    /// Open the sink and start its writer task
    pub async fn open(
        label: impl Into<String>,
        paths: LogPaths,
        merge: bool,
        date_format: Option<String>,
    ) -> Result<Self> {
        let label = label.into();
        let sink = LogSink::open(&paths, merge, date_format).await?;
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = tokio::spawn(run_writer(label.clone(), sink, receiver));

        Ok(Self {
            label,
            paths,
            merged: merge,
            sender: Some(sender),
            pumps: Vec::new(),
            writer: Some(writer),
        })
    }

    /// Start forwarding a freshly spawned child's output
    pub fn attach(&mut self, stdout: ChildStdout, stderr: ChildStderr) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| WardenError::Log(format!("log capture for {} is closed", self.label)))?;

        self.pumps.retain(|pump| !pump.is_finished());
        self.pumps
            .push(tokio::spawn(pump(stdout, StreamKind::Stdout, sender.clone())));
        self.pumps
            .push(tokio::spawn(pump(stderr, StreamKind::Stderr, sender.clone())));
        Ok(())
    }

    /// Stop accepting output, drain what was read and close the sink.
    ///
    /// Pumps still blocked on a pipe after `grace` (a grandchild holding it open) are
    /// aborted; the writer then drains the channel and releases the files.
    pub async fn close(&mut self, grace: Duration) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        self.sender.take();

        let deadline = deadline_after(Instant::now(), grace);
        for mut pump in self.pumps.drain(..) {
            if timeout_at(deadline, &mut pump).await.is_err() {
                debug!("Aborting log pump for {} still attached to an open pipe", self.label);
                pump.abort();
            }
        }

        match timeout_at(deadline_after(deadline, grace), writer).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(WardenError::Log(format!(
                "log writer for {} failed: {}",
                self.label, e
            ))),
            Err(_) => Err(WardenError::Log(format!(
                "log writer for {} did not finish in time",
                self.label
            ))),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    pub fn merged(&self) -> bool {
        self.merged
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn pump<R>(reader: R, stream: StreamKind, sender: mpsc::Sender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = LogLine {
                    stream,
                    bytes: std::mem::take(&mut buf),
                };
                if sender.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading child {:?}: {}", stream, e);
                break;
            }
        }
    }
}

async fn run_writer(
    label: String,
    mut sink: LogSink,
    mut receiver: mpsc::Receiver<LogLine>,
) -> Result<()> {
    while let Some(line) = receiver.recv().await {
        if let Err(e) = sink.write(line.stream, &line.bytes).await {
            warn!("Dropping output of {}: {}", label, e);
        }
    }
    sink.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tempfile::TempDir;
    use tokio::process::Command;

    fn paths(dir: &std::path::Path) -> LogPaths {
        LogPaths {
            stdout: dir.join("app-out.log"),
            stderr: dir.join("app-error.log"),
        }
    }

    async fn run_into(capture: &mut LogCapture, script: &str) {
        let mut child = Command::new("/bin/sh")
            .args(["-c", script])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let stdout = child.stdout.take().unwrap();
        let stderr = child.stderr.take().unwrap();
        capture.attach(stdout, stderr).unwrap();
        child.wait().await.unwrap();
        // let the pumps hit EOF before the next spawn
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_capture_split_streams() {
        let temp_dir = TempDir::new().unwrap();
        let mut capture = LogCapture::open("app#0", paths(temp_dir.path()), false, None)
            .await
            .unwrap();

        run_into(&mut capture, "echo out; echo err >&2").await;
        capture.close(Duration::from_secs(2)).await.unwrap();
        assert!(capture.is_closed());

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        let err = std::fs::read_to_string(temp_dir.path().join("app-error.log")).unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn test_sequence_continues_across_spawns() {
        let temp_dir = TempDir::new().unwrap();
        let mut capture = LogCapture::open("app#0", paths(temp_dir.path()), true, None)
            .await
            .unwrap();

        run_into(&mut capture, "echo first").await;
        run_into(&mut capture, "echo second").await;
        capture.close(Duration::from_secs(2)).await.unwrap();

        let out = std::fs::read_to_string(temp_dir.path().join("app-out.log")).unwrap();
        assert_eq!(out, "[#1] [OUT] first\n[#2] [OUT] second\n");
    }

    #[tokio::test]
    async fn test_attach_after_close_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut capture = LogCapture::open("app#0", paths(temp_dir.path()), false, None)
            .await
            .unwrap();
        capture.close(Duration::from_secs(1)).await.unwrap();

        let mut child = Command::new("/bin/true")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let result = capture.attach(child.stdout.take().unwrap(), child.stderr.take().unwrap());
        assert!(matches!(result, Err(WardenError::Log(_))));
        child.wait().await.unwrap();
    }
}
