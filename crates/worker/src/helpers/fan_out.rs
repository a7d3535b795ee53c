use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tokio::time::Instant;
use tracing::{info, warn};

use chaos_domain::{
    FaultSpec, OrchestratorError, OrchestratorResult, TargetRef, Task, TaskId, TaskType,
};

use crate::aggregator::FanInAggregator;
use crate::helper::{ChildTaskPort, StageContext, TaskHelper};

/// 多目标父任务：每个目标一个子任务，等待全部子任务结束后汇总结果
pub struct FanOutTaskHelper {
    extension_name: String,
    children: Arc<dyn ChildTaskPort>,
    aggregator: FanInAggregator,
}

impl FanOutTaskHelper {
    pub fn new(extension_name: impl Into<String>, children: Arc<dyn ChildTaskPort>) -> Self {
        Self {
            extension_name: extension_name.into(),
            children,
            aggregator: FanInAggregator::new(),
        }
    }

    fn select_targets(spec: &FaultSpec) -> Vec<TargetRef> {
        if spec.random_injection {
            let mut rng = rand::rng();
            spec.targets.choose(&mut rng).cloned().into_iter().collect()
        } else {
            spec.targets.clone()
        }
    }

    fn child_extension(task: &Task) -> OrchestratorResult<String> {
        task.task_data
            .child_extension_name
            .clone()
            .ok_or_else(|| OrchestratorError::validation("扇出任务必须指定 child_extension_name"))
    }

    /// 轮询子任务直到全部结束，任一子任务失败则返回错误
    async fn await_children(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()> {
        let mut pending: HashMap<TaskId, TargetRef> = match task.active_trigger() {
            Some(trigger) => trigger.child_targets.clone().into_iter().collect(),
            None => HashMap::new(),
        };
        let budget = ctx.config.child_timeout() + task.task_data.timeout().unwrap_or_default();
        let deadline = Instant::now() + budget;
        let mut failed: Vec<TargetRef> = Vec::new();

        loop {
            let mut snapshot: HashMap<TargetRef, Task> = HashMap::with_capacity(pending.len());
            for (child_id, target) in &pending {
                match ctx.store.get(child_id).await? {
                    Some(child) => {
                        snapshot.insert(target.clone(), child);
                    }
                    None => warn!("子任务 {} ({}) 尚未写入存储", child_id, target),
                }
            }

            let summary = self.aggregator.process_child_tasks(task, &snapshot);
            failed.extend(summary.failed.iter().cloned());
            let folded: Vec<&TargetRef> = summary.folded().collect();
            pending.retain(|_, target| !folded.contains(&&*target));

            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                let waiting: Vec<String> = pending.values().map(ToString::to_string).collect();
                return Err(OrchestratorError::ExecutionTimeout(format!(
                    "子任务在 {:?} 内未结束: {}",
                    budget,
                    waiting.join(", ")
                )));
            }
            tokio::time::sleep(ctx.config.child_poll_interval()).await;
        }

        if failed.is_empty() {
            Ok(())
        } else {
            let targets: Vec<String> = failed.iter().map(ToString::to_string).collect();
            Err(OrchestratorError::ChildTasksFailed {
                targets: targets.join(", "),
            })
        }
    }
}

#[async_trait]
impl TaskHelper for FanOutTaskHelper {
    fn extension_name(&self) -> &str {
        &self.extension_name
    }

    fn injection_task_type(&self) -> TaskType {
        TaskType::Trigger
    }

    fn validate(&self, spec: &FaultSpec) -> OrchestratorResult<()> {
        spec.validate()?;
        if spec.targets.is_empty() {
            return Err(OrchestratorError::validation("扇出任务至少需要一个目标"));
        }
        if spec.child_extension_name.is_none() {
            return Err(OrchestratorError::validation(
                "扇出任务必须指定 child_extension_name",
            ));
        }
        Ok(())
    }

    fn description(&self, task: &Task) -> String {
        let action = match task.task_type {
            TaskType::Remediation => "Remediating",
            _ => "Injecting",
        };
        format!(
            "{action} fault {} on {} target(s) of {}",
            task.task_data.fault_name,
            task.task_data.targets.len(),
            task.task_data.endpoint_name
        )
    }

    async fn check_prerequisites(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
        if task.task_data.targets.is_empty() {
            return Err(OrchestratorError::Prerequisite("没有可注入的目标".to_string()));
        }
        Self::child_extension(task)?;
        Ok(())
    }

    async fn trigger_injection(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()> {
        if task.child_task_ids().is_empty() {
            let extension = Self::child_extension(task)?;
            let targets = Self::select_targets(&task.task_data);
            for target in &targets {
                let child = self
                    .children
                    .launch_child(Task::child_of(task, target, &extension))
                    .await?;
                if let Some(trigger) = task.active_trigger_mut() {
                    trigger.record_child(target.clone(), child.id);
                }
            }
            task.append_output(&format!("Launched {} child task(s)", targets.len()));
            // 子任务ID先落盘，恢复执行时不会重复创建
            *task = ctx.store.save(task).await?;
        } else {
            info!(
                "任务 {} 恢复执行，继续等待已创建的 {} 个子任务",
                task.id,
                task.child_task_ids().len()
            );
        }
        self.await_children(task, ctx).await
    }

    async fn check_remediation_prerequisites(
        &self,
        task: &mut Task,
        ctx: &StageContext,
    ) -> OrchestratorResult<()> {
        let injection_id = task
            .injection_task_id
            .clone()
            .ok_or_else(|| OrchestratorError::validation("修复任务缺少注入任务ID"))?;
        let injection = ctx
            .store
            .get(&injection_id)
            .await?
            .ok_or_else(|| OrchestratorError::task_not_found(&injection_id))?;
        if injection.remediation_task_id.as_deref() != Some(task.id.as_str()) {
            return Err(OrchestratorError::already_remediated(&injection_id));
        }
        injection.ensure_ready_for_remediation()?;
        if injection.child_task_ids().is_empty() {
            return Err(OrchestratorError::Prerequisite(format!(
                "注入任务 {injection_id} 没有可修复的子任务"
            )));
        }
        Ok(())
    }

    async fn trigger_remediation(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()> {
        if task.child_task_ids().is_empty() {
            let injection_id = task
                .injection_task_id
                .clone()
                .ok_or_else(|| OrchestratorError::validation("修复任务缺少注入任务ID"))?;
            let injection = ctx
                .store
                .get(&injection_id)
                .await?
                .ok_or_else(|| OrchestratorError::task_not_found(&injection_id))?;
            let injected = injection
                .active_trigger()
                .map(|trigger| trigger.child_targets.clone())
                .unwrap_or_default();

            for (child_id, target) in injected {
                match self.children.remediate_child(&child_id).await {
                    Ok(remediation) => {
                        if let Some(trigger) = task.active_trigger_mut() {
                            trigger.record_child(target, remediation.id);
                        }
                    }
                    Err(e) if e.is_remediation_rejection() => {
                        task.append_output(&format!("{target} skipped: {e}"));
                    }
                    Err(e) => return Err(e),
                }
            }
            *task = ctx.store.save(task).await?;
        }
        self.await_children(task, ctx).await
    }
}
