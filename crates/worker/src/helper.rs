use std::sync::Arc;

use async_trait::async_trait;

use chaos_core::ExecutionConfig;
use chaos_domain::{FaultSpec, OrchestratorResult, Task, TaskRepository, TaskType};

use crate::deferred::DeferredOperations;

/// 子阶段执行时可用的节点资源
#[derive(Clone)]
pub struct StageContext {
    pub node_id: String,
    pub store: Arc<dyn TaskRepository>,
    pub deferred: DeferredOperations,
    pub config: ExecutionConfig,
}

/// 任务执行协议
///
/// 每个扩展实现一组有序子阶段，由 `SubstageDriver` 依次调用。子阶段可以修改
/// 任务的输出、失败原因和子任务列表，驱动器在每个子阶段结束后负责持久化。
/// 返回错误会让当前触发进入 FAILED。
#[async_trait]
pub trait TaskHelper: Send + Sync {
    fn extension_name(&self) -> &str;

    /// 提交注入时创建的任务类型
    fn injection_task_type(&self) -> TaskType {
        TaskType::Injection
    }

    /// 提交时的同步校验，失败时任务不会被创建
    fn validate(&self, spec: &FaultSpec) -> OrchestratorResult<()> {
        spec.validate()
    }

    fn description(&self, task: &Task) -> String;

    async fn check_prerequisites(&self, task: &mut Task, ctx: &StageContext)
        -> OrchestratorResult<()>;

    async fn prepare_target(&self, _task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
        Ok(())
    }

    async fn trigger_injection(&self, task: &mut Task, ctx: &StageContext) -> OrchestratorResult<()>;

    async fn check_remediation_prerequisites(
        &self,
        task: &mut Task,
        ctx: &StageContext,
    ) -> OrchestratorResult<()>;

    async fn trigger_remediation(&self, task: &mut Task, ctx: &StageContext)
        -> OrchestratorResult<()>;
}

/// 扇出父任务创建与修复子任务的入口
#[async_trait]
pub trait ChildTaskPort: Send + Sync {
    /// 持久化子任务并写入所有权映射
    async fn launch_child(&self, child: Task) -> OrchestratorResult<Task>;

    /// 为一个注入子任务发起修复，返回新建的修复任务
    async fn remediate_child(&self, child_id: &str) -> OrchestratorResult<Task>;
}
