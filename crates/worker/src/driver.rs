//! 子阶段驱动器
//!
//! 按任务类型决定子阶段计划，逐个调用扩展实现，每个子阶段开始和结束时都持久化
//! `current_stage`/`stage_state`，节点宕机后新的所有者据此从最后一个未完成的
//! 子阶段继续执行。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use chaos_core::FAULT_ALREADY_REMEDIATED;
use chaos_domain::{
    OrchestratorError, OrchestratorResult, StageState, SubStage, Task, TaskCompletedEvent,
    TaskEventPublisher, TaskModifiedEvent, TaskStatus, TaskSubstageEvent, TaskType,
};

use crate::helper::{StageContext, TaskHelper};

const AUTO_REMEDIATION_TIMER: &str = "auto-remediation-timer";

enum TimerOutcome {
    Elapsed,
    Cancelled,
}

pub struct SubstageDriver {
    ctx: StageContext,
    events: Arc<dyn TaskEventPublisher>,
}

impl SubstageDriver {
    pub fn new(ctx: StageContext, events: Arc<dyn TaskEventPublisher>) -> Self {
        Self { ctx, events }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// 任务需要依次经过的子阶段
    pub fn stage_plan(task: &Task) -> Vec<SubStage> {
        match task.task_type {
            TaskType::Remediation => vec![
                SubStage::RemediationPrerequisitesCheck,
                SubStage::TriggerRemediation,
            ],
            _ if task.is_timed_fault() => vec![
                SubStage::PrerequisitesCheck,
                SubStage::PrepareTargetMachine,
                SubStage::TriggerInjection,
                SubStage::TriggerRemediation,
            ],
            _ => vec![
                SubStage::PrerequisitesCheck,
                SubStage::PrepareTargetMachine,
                SubStage::TriggerInjection,
            ],
        }
    }

    /// 根据已持久化的子阶段计算恢复位置
    ///
    /// STARTED 的子阶段重新执行，COMPLETED 的子阶段跳过。
    pub fn resume_index(plan: &[SubStage], task: &Task) -> usize {
        let Some(stage) = task.current_stage() else {
            return 0;
        };
        match plan.iter().position(|s| *s == stage) {
            Some(index) => match task.stage_state() {
                Some(StageState::Completed) => index + 1,
                _ => index,
            },
            None => 0,
        }
    }

    /// 驱动任务的活动触发直到终态
    ///
    /// 返回 Err 表示存储或所有权映射不可用，本次触发被放弃，任务保持原状态。
    #[instrument(skip_all, fields(task_id = %task.id, extension = %task.extension_name))]
    pub async fn drive(
        &self,
        task: Task,
        helper: Arc<dyn TaskHelper>,
        fresh_trigger: bool,
    ) -> OrchestratorResult<Task> {
        let mut task = task;
        self.begin_trigger(&mut task, helper.as_ref(), fresh_trigger);
        self.persist(&mut task).await?;

        let plan = Self::stage_plan(&task);
        let start = Self::resume_index(&plan, &task);
        if start > 0 {
            info!(
                "任务 {} 从子阶段 {:?} 恢复执行",
                task.id,
                plan.get(start).map(SubStage::as_str)
            );
        } else {
            info!(
                "任务 {} 开始执行，第 {} 次触发",
                task.id,
                task.triggers.len()
            );
        }

        for stage in plan.iter().copied().skip(start) {
            if stage == SubStage::TriggerRemediation && task.is_timed_fault() {
                match self.await_remediation_timeout(&task).await {
                    TimerOutcome::Cancelled => {
                        info!("任务 {} 的自动修复定时器已取消，交由显式修复处理", task.id);
                        return Ok(task);
                    }
                    TimerOutcome::Elapsed => {
                        if let Some(latest) = self.ctx.store.get(&task.id).await? {
                            if latest.remediated || latest.is_terminal() {
                                info!("任务 {} 已被修复，跳过自动修复", task.id);
                                return Ok(latest);
                            }
                        }
                    }
                }
            }

            task.set_substage(stage, StageState::Started);
            self.persist_substage(&mut task, stage, StageState::Started)
                .await?;

            match self.run_stage(helper.as_ref(), stage, &mut task).await {
                Ok(()) => {
                    task.set_substage(stage, StageState::Completed);
                    self.persist_substage(&mut task, stage, StageState::Completed)
                        .await?;
                }
                Err(e) if e.abandons_trigger() => {
                    error!("任务 {} 在子阶段 {} 放弃本次触发: {}", task.id, stage, e);
                    return Err(e);
                }
                Err(e) => return self.fail(task, stage, e).await,
            }
        }

        task.set_status(TaskStatus::Completed);
        self.refresh_control_fields(&mut task).await?;
        if task.is_timed_fault() {
            task.remediated = true;
        }
        self.save_and_publish(&mut task).await?;
        self.events.task_completed(TaskCompletedEvent::new(&task));
        info!("任务 {} 执行完成", task.id);

        if task.task_type == TaskType::Remediation {
            self.settle_injection(&task, true).await?;
        }
        Ok(task)
    }

    fn begin_trigger(&self, task: &mut Task, helper: &dyn TaskHelper, fresh_trigger: bool) {
        let needs_new = fresh_trigger
            || task
                .active_trigger()
                .map(|trigger| trigger.task_status.is_terminal())
                .unwrap_or(true);

        if needs_new {
            task.start_new_trigger(&self.ctx.node_id);
        } else if let Some(trigger) = task.active_trigger_mut() {
            trigger.task_status = TaskStatus::InProgress;
            trigger.node = Some(self.ctx.node_id.clone());
            trigger.start_time.get_or_insert_with(Utc::now);
        }

        if task.task_description.is_empty() {
            task.task_description = helper.description(task);
        }
    }

    async fn run_stage(
        &self,
        helper: &dyn TaskHelper,
        stage: SubStage,
        task: &mut Task,
    ) -> OrchestratorResult<()> {
        match stage {
            SubStage::PrerequisitesCheck => helper.check_prerequisites(task, &self.ctx).await,
            SubStage::PrepareTargetMachine => {
                if previous_trigger_completed(task) {
                    task.append_output("Target already prepared by the previous run");
                    Ok(())
                } else {
                    helper.prepare_target(task, &self.ctx).await
                }
            }
            SubStage::TriggerInjection => helper.trigger_injection(task, &self.ctx).await,
            SubStage::RemediationPrerequisitesCheck => {
                helper.check_remediation_prerequisites(task, &self.ctx).await
            }
            SubStage::TriggerRemediation => helper.trigger_remediation(task, &self.ctx).await,
        }
    }

    async fn await_remediation_timeout(&self, task: &Task) -> TimerOutcome {
        let timeout = task.task_data.timeout().unwrap_or_default();
        let started = task
            .active_trigger()
            .and_then(|trigger| trigger.start_time)
            .unwrap_or_else(Utc::now);
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        let remaining = timeout.saturating_sub(elapsed);
        info!("任务 {} 将在 {:?} 后自动修复", task.id, remaining);

        let timer = self
            .ctx
            .deferred
            .schedule(
                &task.id,
                AUTO_REMEDIATION_TIMER,
                tokio::time::sleep(remaining),
            )
            .await;
        match timer.await {
            Ok(()) => TimerOutcome::Elapsed,
            Err(_) => TimerOutcome::Cancelled,
        }
    }

    async fn fail(
        &self,
        mut task: Task,
        stage: SubStage,
        err: OrchestratorError,
    ) -> OrchestratorResult<Task> {
        warn!("任务 {} 在子阶段 {} 失败: {}", task.id, stage, err);
        let mut reason = format!("{stage} failed: {err}");
        if stage.has_side_effects() {
            reason.push_str(". Partial side effects may remain on the target and are not remediated automatically");
        }
        task.append_failure_reason(&reason);
        task.set_status(TaskStatus::Failed);
        self.persist(&mut task).await?;
        self.events.task_completed(TaskCompletedEvent::new(&task));

        if task.task_type == TaskType::Remediation {
            let already_remediated = task
                .failure_reason()
                .is_some_and(|reason| reason.contains(FAULT_ALREADY_REMEDIATED));
            self.settle_injection(&task, already_remediated).await?;
        }
        Ok(task)
    }

    /// 修复任务结束后更新被修复的注入任务
    ///
    /// 修复成功时注入任务标记为已修复，仍在运行的触发置为 COMPLETED；修复失败时
    /// 清除修复标记以便重新发起。
    async fn settle_injection(&self, remediation: &Task, remediated: bool) -> OrchestratorResult<()> {
        let Some(injection_id) = remediation.injection_task_id.as_deref() else {
            return Ok(());
        };
        let Some(mut injection) = self.ctx.store.get(injection_id).await? else {
            warn!("修复任务 {} 对应的注入任务 {} 不存在", remediation.id, injection_id);
            return Ok(());
        };
        if injection.remediation_task_id.as_deref() != Some(remediation.id.as_str()) {
            debug!("注入任务 {} 已由其他修复任务负责", injection_id);
            return Ok(());
        }

        if !remediated {
            injection.remediated = false;
            injection.remediation_task_id = None;
            self.save_and_publish(&mut injection).await?;
            return Ok(());
        }

        injection.remediated = true;
        let was_running = injection.status() == TaskStatus::InProgress;
        if was_running {
            injection.append_output(&format!("Remediated by task {}", remediation.id));
            injection.set_status(TaskStatus::Completed);
        }
        self.save_and_publish(&mut injection).await?;
        if was_running {
            self.events
                .task_completed(TaskCompletedEvent::new(&injection));
        }
        info!("注入任务 {} 已由 {} 修复", injection_id, remediation.id);
        Ok(())
    }

    /// 修复标记与调度状态由编排服务维护，驱动器保存前以存储中的值为准
    async fn refresh_control_fields(&self, task: &mut Task) -> OrchestratorResult<()> {
        if let Some(latest) = self.ctx.store.get(&task.id).await? {
            task.remediated = latest.remediated;
            task.remediation_task_id = latest.remediation_task_id;
            task.schedule_status = latest.schedule_status;
        }
        Ok(())
    }

    async fn persist(&self, task: &mut Task) -> OrchestratorResult<()> {
        self.refresh_control_fields(task).await?;
        self.save_and_publish(task).await
    }

    async fn save_and_publish(&self, task: &mut Task) -> OrchestratorResult<()> {
        *task = self.ctx.store.save(task).await?;
        self.events.task_modified(TaskModifiedEvent::new(task));
        Ok(())
    }

    async fn persist_substage(
        &self,
        task: &mut Task,
        stage: SubStage,
        state: StageState,
    ) -> OrchestratorResult<()> {
        self.refresh_control_fields(task).await?;
        *task = self.ctx.store.save(task).await?;
        self.events
            .task_substage_changed(TaskSubstageEvent::new(&task.id, stage, state));
        self.events.task_modified(TaskModifiedEvent::new(task));
        debug!("任务 {} 子阶段 {} {:?}", task.id, stage, state);
        Ok(())
    }
}

fn previous_trigger_completed(task: &Task) -> bool {
    let count = task.triggers.len();
    count >= 2 && task.triggers[count - 2].task_status == TaskStatus::Completed
}
