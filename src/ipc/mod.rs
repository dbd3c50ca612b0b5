// IPC module - Communication between client and daemon

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{
    Command, EntryError, ErrorReply, InstanceInfo, InstanceLogs, LogReport, Request, Response,
    ResponseData, StartReport,
};
pub use server::IpcServer;
