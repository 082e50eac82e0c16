pub mod builtin;
pub mod manager;
pub mod store;
pub mod triggers;
pub mod types;
pub mod worker;

pub use manager::TaskManager;
pub use store::TaskStore;
pub use types::{TaskCompletionStatus, TaskInfo, TaskOptions, TaskResult, TaskState, TaskTriggerInfo};
pub use worker::{ProgressSink, ScheduledTask, ScheduledTaskWorker, WorkerSettings};
