use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Samples resident memory of supervised children.
///
/// Only the requested pid is refreshed, so a sample costs one `/proc` read.
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Resident set size of `pid` in bytes
    ///
    /// # Returns
    /// * `Some(bytes)` - The process is alive
    /// * `None` - The process is gone or already a zombie
    pub fn sample(&mut self, pid: u32) -> Option<u64> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );

        let process = self.system.process(sys_pid)?;
        if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
            return None;
        }
        Some(process.memory())
    }

    /// Drop cached data for a pid that will not be sampled again
    pub fn forget(&mut self, pid: u32) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::new(),
        );
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a sample is over the configured limit
pub fn exceeds_limit(sample: u64, limit: Option<u64>) -> bool {
    limit.is_some_and(|limit| sample > limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_own_process() {
        let mut monitor = ResourceMonitor::new();
        let rss = monitor.sample(std::process::id());
        assert!(rss.is_some_and(|bytes| bytes > 0));
    }

    #[tokio::test]
    async fn test_sample_exited_process() {
        let mut child = tokio::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let mut monitor = ResourceMonitor::new();
        assert_eq!(monitor.sample(pid), None);
    }

    #[test]
    fn test_exceeds_limit() {
        assert!(exceeds_limit(2048, Some(1024)));
        assert!(!exceeds_limit(1024, Some(1024)));
        assert!(!exceeds_limit(u64::MAX, None));
    }
}
