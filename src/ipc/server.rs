// IPC Server - Listens for client connections and handles requests

use crate::error::{Result, WardenError};
use crate::ipc::protocol::{Command, Request, Response, ResponseData};
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Unix socket server speaking newline-delimited JSON
pub struct IpcServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the socket, replacing a stale file, and restrict it to the owner (0600)
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let socket_path = path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                WardenError::Ipc(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| WardenError::Ipc(format!("Failed to bind to socket: {}", e)))?;

        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| WardenError::Ipc(format!("Failed to set socket permissions: {}", e)))?;

        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Each connection runs on its own task and may carry several requests, one per line.
    pub async fn run<F, Fut, S>(&self, handler: F, shutdown: S) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = Self::serve_connection(stream, handler).await {
                            debug!("Connection ended with error: {}", e);
                        }
                    });
                }
            }
        }
    }

    async fn serve_connection<F, Fut>(stream: UnixStream, handler: Arc<F>) -> Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseData>> + Send + 'static,
    {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| WardenError::Ipc(format!("Failed to read request: {}", e)))?
        {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => match handler(request.command).await {
                    Ok(data) => Response::success(request.id, data),
                    Err(e) => Response::error(request.id, &e),
                },
                Err(e) => Response::error(
                    0,
                    &WardenError::Protocol(format!("Failed to deserialize request: {}", e)),
                ),
            };

            let mut response_json = serde_json::to_string(&response).map_err(|e| {
                WardenError::Protocol(format!("Failed to serialize response: {}", e))
            })?;
            response_json.push('\n');

            writer
                .write_all(response_json.as_bytes())
                .await
                .map_err(|e| WardenError::Ipc(format!("Failed to write response: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| WardenError::Ipc(format!("Failed to flush stream: {}", e)))?;
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_sets_owner_only_permissions() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");

        let server = IpcServer::bind(&socket_path).unwrap();
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(server.socket_path(), socket_path);
    }

    #[tokio::test]
    async fn test_socket_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        {
            let _server = IpcServer::bind(&socket_path).unwrap();
            assert!(socket_path.exists());
        }
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("warden.sock");
        std::fs::write(&socket_path, "").unwrap();

        assert!(IpcServer::bind(&socket_path).is_ok());
    }
}
