pub mod task_execution;

pub use task_execution::TaskExecutionManager;
