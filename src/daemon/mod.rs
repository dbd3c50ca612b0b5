// Daemon module - Background supervisor process

pub mod manager;
pub mod pid;
mod runtime;

pub use manager::{DaemonManager, DAEMON_BINARY};
pub use pid::PidFile;
pub use runtime::Daemon;
