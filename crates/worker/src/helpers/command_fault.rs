use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use chaos_domain::{
    CommandExecutor, CommandInfo, EndpointConnector, FaultCommandBuilder, OrchestratorError,
    OrchestratorResult, Task, TaskType,
};

use crate::command_runner::CommandRunner;
use crate::helper::{StageContext, TaskHelper};
use crate::retry::RetryPolicy;

/// 单目标命令型故障
///
/// 通过端点连接器获得命令执行客户端，由命令构建器生成注入与修复命令。
pub struct CommandFaultTaskHelper {
    extension_name: String,
    connector: Arc<dyn EndpointConnector>,
    builder: Arc<dyn FaultCommandBuilder>,
    runner: CommandRunner,
}

impl CommandFaultTaskHelper {
    pub fn new(
        extension_name: impl Into<String>,
        connector: Arc<dyn EndpointConnector>,
        builder: Arc<dyn FaultCommandBuilder>,
        runner: CommandRunner,
    ) -> Self {
        Self {
            extension_name: extension_name.into(),
            connector,
            builder,
            runner,
        }
    }

    async fn connected_executor(
        &self,
        task: &Task,
        ctx: &StageContext,
    ) -> OrchestratorResult<Arc<dyn CommandExecutor>> {
        let executor = self.connector.connect(&task.task_data).await?;
        let policy = RetryPolicy::new(
            ctx.config.connectivity_retry_attempts,
            ctx.config.connectivity_retry_interval(),
        );
        let connector = &executor;
        policy
            .retry_idempotent("端点连通性检查", move || connector.test_connection())
            .await?;
        Ok(executor)
    }

    async fn run_commands(
        &self,
        task: &mut Task,
        commands: &[CommandInfo],
    ) -> OrchestratorResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let executor = self.connector.connect(&task.task_data).await?;
        self.runner
            .run_all(
                executor.as_ref(),
                commands,
                &task.task_data.args,
                &mut task.troubleshooting_info,
            )
            .await?;
        Ok(())
    }

    fn endpoint(task: &Task) -> String {
        match task.task_data.targets.first() {
            Some(target) => format!("{} ({target})", task.task_data.endpoint_name),
            None => task.task_data.endpoint_name.clone(),
        }
    }
}

#[async_trait]
impl TaskHelper for CommandFaultTaskHelper {
    fn extension_name(&self) -> &str {
        &self.extension_name
    }

    fn description(&self, task: &Task) -> String {
        let action = match task.task_type {
            TaskType::Remediation => "Remediating",
            _ => "Injecting",
        };
        format!(
            "{action} fault {} on {}",
            task.task_data.fault_name,
            Self::endpoint(task)
        )
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn check_prerequisites(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()> {
        self.connected_executor(task, ctx).await?;

        if task.task_data.injection_commands.is_empty() {
            task.task_data.injection_commands = self.builder.injection_commands(&task.task_data)?;
        }
        if task.task_data.remediation_commands.is_empty() {
            task.task_data.remediation_commands =
                self.builder.remediation_commands(&task.task_data)?;
        }
        if task.task_data.injection_commands.is_empty() {
            return Err(OrchestratorError::Prerequisite(format!(
                "故障 {} 没有可执行的注入命令",
                task.task_data.fault_name
            )));
        }
        task.append_output(&format!("Endpoint {} is reachable", Self::endpoint(task)));
        Ok(())
    }

    async fn prepare_target(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
        let commands = self.builder.preparation_commands(&task.task_data)?;
        if commands.is_empty() {
            return Ok(());
        }
        self.run_commands(task, &commands).await?;
        task.append_output("Target machine prepared");
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn trigger_injection(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
        let commands = task.task_data.injection_commands.clone();
        self.run_commands(task, &commands).await?;
        task.append_output("Completed Fault Injection");
        info!("任务 {} 已在 {} 上注入故障", task.id, Self::endpoint(task));
        Ok(())
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

        self.connected_executor(task, ctx).await?;
        if task.task_data.remediation_commands.is_empty() {
            task.task_data.remediation_commands = if injection.task_data.remediation_commands.is_empty() {
                self.builder.remediation_commands(&task.task_data)?
            } else {
                injection.task_data.remediation_commands.clone()
            };
        }
        // 注入阶段提取的信息（进程号等）供修复命令替换参数
        for (key, value) in injection.troubleshooting_info {
            task.troubleshooting_info.entry(key).or_insert(value);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn trigger_remediation(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()> {
        let injection_id = task
            .injection_task_id
            .clone()
            .unwrap_or_else(|| task.id.clone());
        let cancelled = ctx
            .deferred
            .cancel_all(&injection_id, ctx.config.cancellation_wait())
            .await;
        if cancelled > 0 {
            info!("已取消任务 {} 的 {} 个延迟操作", injection_id, cancelled);
        }

        if task.task_data.remediation_commands.is_empty() {
            task.task_data.remediation_commands =
                self.builder.remediation_commands(&task.task_data)?;
        }
        let commands = task.task_data.remediation_commands.clone();
        if commands.is_empty() {
            task.append_output("No remediation commands for this fault");
            return Ok(());
        }
        self.run_commands(task, &commands).await?;
        task.append_output("Completed Fault Remediation");
        Ok(())
    }
}
