//! 在本机上执行故障命令

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use chaos_domain::{
    entities::{CommandInfo, FaultSpec},
    ports::{CommandExecutionResult, CommandExecutor, EndpointConnector, FaultCommandBuilder},
    OrchestratorError, OrchestratorResult,
};

/// 通过 `sh -c` 在本机运行命令
#[derive(Debug, Clone)]
pub struct LocalCommandExecutor {
    shell: String,
}

impl LocalCommandExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for LocalCommandExecutor {
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<CommandExecutionResult> {
        debug!("执行本地命令: {}", command);
        let mut process = Command::new(&self.shell);
        process.arg("-c").arg(command).kill_on_drop(true);

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, process.output())
                .await
                .map_err(|_| {
                    OrchestratorError::ExecutionTimeout(format!(
                        "命令 {command} 在 {}ms 内未结束",
                        limit.as_millis()
                    ))
                })?,
            None => process.output().await,
        }
        .map_err(|e| OrchestratorError::Connectivity(format!("无法启动本地进程: {e}")))?;

        let mut command_output = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            command_output.push_str(&stderr);
        }

        Ok(CommandExecutionResult {
            command_output,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn test_connection(&self) -> OrchestratorResult<()> {
        let result = self.execute_command("true", Some(Duration::from_secs(5))).await?;
        if result.exit_code == 0 {
            Ok(())
        } else {
            Err(OrchestratorError::Connectivity(format!(
                "本地 shell {} 不可用",
                self.shell
            )))
        }
    }
}

/// 把所有端点都解析为本机
#[derive(Debug, Clone, Default)]
pub struct LocalEndpointConnector {
    executor: Arc<LocalCommandExecutor>,
}

impl LocalEndpointConnector {
    pub fn new(executor: LocalCommandExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

#[async_trait]
impl EndpointConnector for LocalEndpointConnector {
    async fn connect(&self, spec: &FaultSpec) -> OrchestratorResult<Arc<dyn CommandExecutor>> {
        debug!("端点 {} 解析为本地执行器", spec.endpoint_name);
        let executor: Arc<dyn CommandExecutor> = self.executor.clone();
        Ok(executor)
    }
}

/// 直接使用故障规格中携带的命令列表
#[derive(Debug, Clone, Default)]
pub struct EmbeddedCommandBuilder;

impl FaultCommandBuilder for EmbeddedCommandBuilder {
    fn injection_commands(&self, spec: &FaultSpec) -> OrchestratorResult<Vec<CommandInfo>> {
        if spec.injection_commands.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "故障 {} 没有提供注入命令",
                spec.fault_name
            )));
        }
        Ok(spec.injection_commands.clone())
    }

    fn remediation_commands(&self, spec: &FaultSpec) -> OrchestratorResult<Vec<CommandInfo>> {
        Ok(spec.remediation_commands.clone())
    }
}
