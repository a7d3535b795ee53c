use std::collections::HashMap;

use tracing::debug;

use chaos_domain::{TargetRef, Task, TaskStatus};

/// 一次聚合的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationSummary {
    pub succeeded: Vec<TargetRef>,
    pub failed: Vec<TargetRef>,
    pub pending: Vec<TargetRef>,
}

impl AggregationSummary {
    /// 本次已经并入父任务的目标
    pub fn folded(&self) -> impl Iterator<Item = &TargetRef> {
        self.succeeded.iter().chain(self.failed.iter())
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }
}

/// 把子任务结果并入扇出父任务
///
/// 只追加输出和失败原因，父任务状态由调用方决定。调用方需要把已经并入的子任务
/// 从下一轮输入中移除，否则同一结果会被重复追加。
#[derive(Debug, Default, Clone, Copy)]
pub struct FanInAggregator;

impl FanInAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn process_child_tasks(
        &self,
        parent: &mut Task,
        children: &HashMap<TargetRef, Task>,
    ) -> AggregationSummary {
        let mut summary = AggregationSummary::default();
        for (target, child) in children {
            match child.status() {
                TaskStatus::Completed => {
                    parent.append_output(&format!("{target} Result: SUCCESS {}", child.id));
                    summary.succeeded.push(target.clone());
                }
                TaskStatus::Failed => {
                    parent.append_output(&format!("{target} Result: FAILED {}", child.id));
                    let reason = child.failure_reason().unwrap_or("no failure reason recorded");
                    parent.append_failure_reason(&format!("{target} {reason}"));
                    summary.failed.push(target.clone());
                }
                TaskStatus::Initializing | TaskStatus::InProgress => {
                    summary.pending.push(target.clone());
                }
            }
        }
        debug!(
            "父任务 {} 聚合子任务: 成功 {}，失败 {}，未完成 {}",
            parent.id,
            summary.succeeded.len(),
            summary.failed.len(),
            summary.pending.len()
        );
        summary
    }
}
