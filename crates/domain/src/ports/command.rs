use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chaos_core::OrchestratorResult;

use crate::entities::{CommandInfo, FaultSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutionResult {
    pub command_output: String,
    pub exit_code: i32,
}

/// 针对单个端点的命令执行客户端
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> OrchestratorResult<CommandExecutionResult>;

    /// 只读的连通性检查，可以安全重试
    async fn test_connection(&self) -> OrchestratorResult<()>;
}

/// 根据故障规格解析出命令执行客户端
#[async_trait]
pub trait EndpointConnector: Send + Sync {
    async fn connect(&self, spec: &FaultSpec) -> OrchestratorResult<Arc<dyn CommandExecutor>>;
}

/// 根据故障规格生成注入与修复命令
pub trait FaultCommandBuilder: Send + Sync {
    fn injection_commands(&self, spec: &FaultSpec) -> OrchestratorResult<Vec<CommandInfo>>;
    fn remediation_commands(&self, spec: &FaultSpec) -> OrchestratorResult<Vec<CommandInfo>>;

    /// 在目标上准备支持文件的命令
    fn preparation_commands(&self, _spec: &FaultSpec) -> OrchestratorResult<Vec<CommandInfo>> {
        Ok(Vec::new())
    }
}
