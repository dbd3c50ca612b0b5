// PID file management for the daemon process

use crate::error::{Result, WardenError};
use std::fs;
use std::path::{Path, PathBuf};

/// The daemon's PID file
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Write the current process PID to the file
    pub fn write(&self) -> Result<()> {
        fs::write(&self.path, std::process::id().to_string())
            .map_err(|e| WardenError::Daemon(format!("Failed to write PID file: {}", e)))
    }

    pub fn read(&self) -> Result<u32> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| WardenError::Daemon(format!("Failed to read PID file: {}", e)))?;

        content
            .trim()
            .parse::<u32>()
            .map_err(|e| WardenError::Daemon(format!("Invalid PID in file: {}", e)))
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> Result<()> {
        if self.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| WardenError::Daemon(format!("Failed to remove PID file: {}", e)))?;
        }
        Ok(())
    }

    /// PID recorded in the file, if that process is still alive
    pub fn live_pid(&self) -> Option<u32> {
        self.read().ok().filter(|pid| is_process_alive(*pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Probe with signal 0
fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_pid() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = PidFile::with_path(temp_dir.path().join("wardend.pid"));

        pid_file.write().unwrap();
        assert_eq!(pid_file.read().unwrap(), std::process::id());
        assert_eq!(pid_file.live_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = PidFile::with_path(temp_dir.path().join("wardend.pid"));

        pid_file.write().unwrap();
        assert!(pid_file.exists());

        pid_file.remove().unwrap();
        assert!(!pid_file.exists());
        // Removing twice is fine
        pid_file.remove().unwrap();
    }

    #[test]
    fn test_garbage_pid_is_not_live() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = PidFile::with_path(temp_dir.path().join("wardend.pid"));
        fs::write(pid_file.path(), "not-a-pid").unwrap();

        assert!(pid_file.read().is_err());
        assert_eq!(pid_file.live_pid(), None);
    }
}
