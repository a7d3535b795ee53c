pub mod aggregator;
pub mod command_runner;
pub mod components;
pub mod deferred;
pub mod driver;
pub mod helper;
pub mod helpers;
pub mod registry;
pub mod retry;

pub use aggregator::{AggregationSummary, FanInAggregator};
pub use command_runner::CommandRunner;
pub use components::TaskExecutionManager;
pub use deferred::DeferredOperations;
pub use driver::SubstageDriver;
pub use helper::{ChildTaskPort, StageContext, TaskHelper};
pub use helpers::{CommandFaultTaskHelper, FanOutTaskHelper};
pub use registry::{HelperFactory, HelperRegistry};
pub use retry::RetryPolicy;
