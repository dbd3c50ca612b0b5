// IPC Client - Communicates with the daemon via Unix socket

use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, Request, Response, ResponseData};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Maximum number of connection attempts
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between connection attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Blocking IPC client; one connection per command
pub struct IpcClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl IpcClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    /// Send a command and wait for its result.
    ///
    /// Daemon-side failures come back as [`WardenError::Remote`] with their original kind.
    pub fn send(&self, command: Command) -> Result<ResponseData> {
        let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = Request::new(request_id, command);

        let stream = self.connect_with_retry()?;
        let response = Self::exchange(stream, &request)?;

        if response.id != request_id {
            return Err(WardenError::Protocol(format!(
                "Response ID mismatch: expected {}, got {}",
                request_id, response.id
            )));
        }

        response.result.map_err(WardenError::from)
    }

    /// Whether a daemon answers on the socket
    pub fn ping(&self) -> bool {
        matches!(self.send(Command::Ping), Ok(ResponseData::Pong { .. }))
    }

    /// Only connecting is retried; a request that reached the daemon is never resent
    fn connect_with_retry(&self) -> Result<UnixStream> {
        let mut last_error = None;
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            match self.connect() {
                Ok(stream) => return Ok(stream),
                Err(WardenError::DaemonNotRunning) => return Err(WardenError::DaemonNotRunning),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRY_ATTEMPTS {
                        std::thread::sleep(RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| WardenError::Ipc("Failed to connect after retries".to_string())))
    }

    fn exchange(mut stream: UnixStream, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)
            .map_err(|e| WardenError::Protocol(format!("Failed to serialize request: {}", e)))?;

        writeln!(stream, "{}", request_json)
            .map_err(|e| WardenError::Ipc(format!("Failed to write request: {}", e)))?;
        stream
            .flush()
            .map_err(|e| WardenError::Ipc(format!("Failed to flush stream: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let n = reader
            .read_line(&mut response_line)
            .map_err(|e| WardenError::Ipc(format!("Failed to read response: {}", e)))?;
        if n == 0 {
            return Err(WardenError::Ipc(
                "Daemon closed the connection without answering".to_string(),
            ));
        }

        serde_json::from_str(&response_line)
            .map_err(|e| WardenError::Protocol(format!("Failed to deserialize response: {}", e)))
    }

    fn connect(&self) -> Result<UnixStream> {
        if !self.socket_path.exists() {
            return Err(WardenError::DaemonNotRunning);
        }

        UnixStream::connect(&self.socket_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                WardenError::DaemonNotRunning
            }
            _ => WardenError::Ipc(format!("Failed to connect to daemon: {}", e)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}
