use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chaos_core::{AppConfig, StoreBackend};
use chaos_dispatcher::{HelperInstaller, NodeRuntime};
use chaos_domain::TaskRepository;
use chaos_infrastructure::{
    EmbeddedCommandBuilder, InMemoryCluster, InMemoryTaskRepository, LocalCommandExecutor,
    LocalEndpointConnector, SqliteTaskRepository,
};
use chaos_worker::{CommandFaultTaskHelper, CommandRunner, FanOutTaskHelper, TaskHelper};

use crate::shutdown::ShutdownSignal;

pub const COMMAND_FAULT_EXTENSION: &str = "command-fault";
pub const FAN_OUT_EXTENSION: &str = "fan-out";

/// 主应用程序：一个进程内的若干集群成员共享同一个任务存储
pub struct Application {
    config: AppConfig,
    cluster: InMemoryCluster,
    nodes: Mutex<Vec<NodeRuntime>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = create_task_store(&config).await?;
        let cluster = InMemoryCluster::new(&config.cluster);
        let sweeper = cluster.start_eviction_sweeper();
        let installer = builtin_helpers(&config);

        let mut nodes = Vec::with_capacity(config.node.local_members);
        for node_id in member_ids(&config) {
            let node = NodeRuntime::start(
                &node_id,
                &cluster,
                Arc::clone(&store),
                config.execution.clone(),
                &installer,
            )
            .await
            .with_context(|| format!("启动节点 {node_id} 失败"))?;
            nodes.push(node);
        }

        if let Some(first) = nodes.first() {
            let report = first
                .recovery()
                .rebuild_ownership()
                .await
                .context("重建所有权映射失败")?;
            if !report.errors.is_empty() {
                warn!("所有权映射重建时出现 {} 个错误", report.errors.len());
            }
            info!("启动恢复重新插入 {} 个条目", report.total());
        }

        Ok(Self {
            config,
            cluster,
            nodes: Mutex::new(nodes),
            sweeper,
        })
    }

    /// 运行直到收到关闭信号，然后依次停止各节点
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        info!(
            "集群已就绪，成员: {:?}",
            self.cluster.members().await
        );

        if shutdown.is_triggered() {
            warn!("集群就绪前已触发关闭");
        }
        shutdown.wait().await;
        info!("应用收到关闭信号");
        self.stop().await;
        Ok(())
    }

    pub async fn stop(&self) {
        let nodes: Vec<NodeRuntime> = self.nodes.lock().await.drain(..).collect();
        for node in nodes {
            let node_id = node.node_id().to_string();
            if let Err(e) = node.shutdown().await {
                error!("停止节点 {} 失败: {}", node_id, e);
            }
        }
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
        info!("节点 {} 的所有本地成员已停止", self.config.node.node_id);
    }

    #[cfg(test)]
    pub async fn orchestrator(&self) -> Option<Arc<chaos_dispatcher::OrchestrationService>> {
        self.nodes.lock().await.first().map(NodeRuntime::orchestrator)
    }
}

async fn create_task_store(config: &AppConfig) -> Result<Arc<dyn TaskRepository>> {
    let store: Arc<dyn TaskRepository> = match config.store.backend {
        StoreBackend::Memory => {
            info!("使用内存任务存储");
            Arc::new(InMemoryTaskRepository::new())
        }
        StoreBackend::Sqlite => {
            info!("使用SQLite任务存储: {}", config.store.url);
            Arc::new(
                SqliteTaskRepository::new_embedded(&config.store.url, config.store.max_connections)
                    .await
                    .context("初始化SQLite任务存储失败")?,
            )
        }
    };
    Ok(store)
}

fn member_ids(config: &AppConfig) -> Vec<String> {
    if config.node.local_members <= 1 {
        return vec![config.node.node_id.clone()];
    }
    (1..=config.node.local_members)
        .map(|index| format!("{}-{}", config.node.node_id, index))
        .collect()
}

/// 内置扩展：本机命令故障与多目标扇出
fn builtin_helpers(config: &AppConfig) -> HelperInstaller {
    let retry_interval = Duration::from_secs(config.execution.command_retry_interval_seconds);
    Arc::new(move |children| {
        let command_fault = CommandFaultTaskHelper::new(
            COMMAND_FAULT_EXTENSION,
            Arc::new(LocalEndpointConnector::new(LocalCommandExecutor::new())),
            Arc::new(EmbeddedCommandBuilder),
            CommandRunner::new(retry_interval),
        );
        vec![
            Arc::new(command_fault) as Arc<dyn TaskHelper>,
            Arc::new(FanOutTaskHelper::new(FAN_OUT_EXTENSION, children)),
        ]
    })
}
