/// Builders for constructing dispatcher instances.
pub mod builder;
/// Dispatcher owning the watched tubes and their workers.
pub mod dispatcher;
/// Execution supervisor running one job under a deadline.
pub mod supervisor;
/// Per-tube worker loop.
pub mod worker;

pub use builder::{DispatcherBuilder, ProcessDispatcherBuilder};
pub use dispatcher::{Dispatcher, DispatcherConfig, ShutdownToken, WorkerGroup, WorkerGroupGuard};
pub use supervisor::{
    supervise, ExecutionError, ExecutorCommand, JobExecutor, ProcessExecutor, ENTRY_SCRIPT,
};
pub use worker::{Pacer, Worker, WorkerConfig, WorkerExit, WorkerState};
