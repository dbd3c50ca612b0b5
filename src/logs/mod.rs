// Logs module - output capture, sinks and readers

mod capture;
mod reader;
mod writer;

pub use capture::{LogCapture, LogLine};
pub use reader::{read_logs, read_tail, LogEntry, LogFollower, LogSource};
pub use writer::{LogSink, StreamKind};
