use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use chaos_domain::{OrchestratorResult, Task};
use chaos_worker::ChildTaskPort;

use crate::orchestrator::{OrchestrationService, TaskOrchestrator};

/// 扇出父任务通过编排服务创建与修复子任务
///
/// 子任务和普通任务走同一条路径：持久化、发布创建事件、写入所有权映射，
/// 由其所在分区的所有者节点驱动。
pub struct ChildTaskSubmitter {
    orchestrator: Arc<OrchestrationService>,
}

impl ChildTaskSubmitter {
    pub fn new(orchestrator: Arc<OrchestrationService>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ChildTaskPort for ChildTaskSubmitter {
    async fn launch_child(&self, child: Task) -> OrchestratorResult<Task> {
        debug!(
            "父任务 {:?} 创建子任务 {}",
            child.parent_task_id, child.id
        );
        self.orchestrator.enqueue(child).await
    }

    async fn remediate_child(&self, child_id: &str) -> OrchestratorResult<Task> {
        self.orchestrator.remediate(child_id).await
    }
}
