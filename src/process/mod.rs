// Process module - Core process lifecycle management

mod manager;
pub mod monitor;
pub mod restart;
pub mod spawner;
pub mod supervisor;
mod types;

pub use manager::ProcessManager;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use types::{InstanceId, RuntimeFault, RuntimeState, Status, TransitionEvent};
