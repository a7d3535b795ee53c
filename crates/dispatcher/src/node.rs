use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use chaos_core::ExecutionConfig;
use chaos_domain::{OrchestratorResult, OwnershipMap, TaskEventPublisher, TaskRepository};
use chaos_infrastructure::{BroadcastEventBus, InMemoryCluster};
use chaos_worker::{
    ChildTaskPort, DeferredOperations, HelperRegistry, StageContext, TaskExecutionManager,
    TaskHelper,
};

use crate::child_submitter::ChildTaskSubmitter;
use crate::orchestrator::OrchestrationService;
use crate::ownership_listener::OwnershipListener;
use crate::recovery_service::RecoveryService;
use crate::schedule_runner::ScheduleRunner;
use crate::subscribers::{MetricsSubscriber, OwnershipSyncSubscriber};

/// 根据子任务入口构造本节点的任务扩展
pub type HelperInstaller =
    Arc<dyn Fn(Arc<dyn ChildTaskPort>) -> Vec<Arc<dyn TaskHelper>> + Send + Sync>;

/// 一个集群成员的完整运行时
///
/// 所有组件都持有同一个节点视角的映射句柄；监听器在所有组件构造完成后
/// 随 `join` 注册，加入后迁移到本节点的条目会立即触发回调。
pub struct NodeRuntime {
    node_id: String,
    cluster: InMemoryCluster,
    ownership: Arc<dyn OwnershipMap>,
    store: Arc<dyn TaskRepository>,
    orchestrator: Arc<OrchestrationService>,
    execution: Arc<TaskExecutionManager>,
    schedules: Arc<ScheduleRunner>,
    events: BroadcastEventBus,
    subscribers: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    pub async fn start(
        node_id: &str,
        cluster: &InMemoryCluster,
        store: Arc<dyn TaskRepository>,
        config: ExecutionConfig,
        installer: &HelperInstaller,
    ) -> OrchestratorResult<Self> {
        let events = BroadcastEventBus::default();
        let publisher: Arc<dyn TaskEventPublisher> = Arc::new(events.clone());
        let ownership: Arc<dyn OwnershipMap> = Arc::new(cluster.handle(node_id));
        let registry = HelperRegistry::new();

        let ctx = StageContext {
            node_id: node_id.to_string(),
            store: Arc::clone(&store),
            deferred: DeferredOperations::new(),
            config,
        };
        let execution = Arc::new(TaskExecutionManager::new(
            ctx,
            registry.clone(),
            Arc::clone(&publisher),
        ));
        let schedules = Arc::new(ScheduleRunner::new(
            Arc::clone(&store),
            Arc::clone(&execution),
            Arc::clone(&ownership),
            Arc::clone(&publisher),
        ));
        let listener = Arc::new(OwnershipListener::new(
            Arc::clone(&store),
            Arc::clone(&ownership),
            Arc::clone(&execution),
            Arc::clone(&schedules),
        ));
        let orchestrator = Arc::new(OrchestrationService::new(
            Arc::clone(&store),
            Arc::clone(&ownership),
            registry.clone(),
            Arc::clone(&publisher),
        ));

        let children: Arc<dyn ChildTaskPort> =
            Arc::new(ChildTaskSubmitter::new(Arc::clone(&orchestrator)));
        for helper in installer(children) {
            registry.register(helper).await;
        }

        let subscribers = vec![
            OwnershipSyncSubscriber::new(Arc::clone(&ownership)).spawn(events.subscribe_modified()),
            MetricsSubscriber::new(Arc::clone(&store)).spawn(events.subscribe_completed()),
        ];

        cluster.join(node_id, listener).await?;
        info!(
            "节点 {} 已启动，注册扩展: {:?}",
            node_id,
            registry.list_extensions().await
        );

        Ok(Self {
            node_id: node_id.to_string(),
            cluster: cluster.clone(),
            ownership,
            store,
            orchestrator,
            execution,
            schedules,
            events,
            subscribers,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn orchestrator(&self) -> Arc<OrchestrationService> {
        Arc::clone(&self.orchestrator)
    }

    pub fn execution(&self) -> Arc<TaskExecutionManager> {
        Arc::clone(&self.execution)
    }

    pub fn events(&self) -> &BroadcastEventBus {
        &self.events
    }

    pub fn recovery(&self) -> RecoveryService {
        RecoveryService::new(Arc::clone(&self.store), Arc::clone(&self.ownership))
    }

    /// 停止本地驱动并离开集群
    ///
    /// 离开后本节点的条目迁移到其他成员，由新所有者按幂等保护接手。
    pub async fn shutdown(self) -> OrchestratorResult<()> {
        self.schedules.shutdown().await;
        self.execution.shutdown().await;
        for handle in self.subscribers {
            handle.abort();
        }
        self.cluster.leave(&self.node_id).await?;
        info!("节点 {} 已停止", self.node_id);
        Ok(())
    }
}
