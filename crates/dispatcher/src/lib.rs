//! 分布式所有权层与编排服务
//!
//! 每个集群成员运行一个 `NodeRuntime`：所有权回调驱动本节点负责的任务，
//! 编排服务负责提交、修复、查询与调度控制。

pub mod child_submitter;
pub mod cron_utils;
pub mod node;
pub mod orchestrator;
pub mod ownership_listener;
pub mod recovery_service;
pub mod schedule_runner;
pub mod subscribers;

pub use child_submitter::ChildTaskSubmitter;
pub use cron_utils::CronScheduler;
pub use node::{HelperInstaller, NodeRuntime};
pub use orchestrator::{entry_value, OrchestrationService, TaskOrchestrator};
pub use ownership_listener::{OwnershipListener, TriggerDecision};
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use schedule_runner::ScheduleRunner;
pub use subscribers::{MetricsSubscriber, OwnershipSyncSubscriber};
