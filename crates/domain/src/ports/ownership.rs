use async_trait::async_trait;

use chaos_core::OrchestratorResult;

/// 请求修复时写入注入任务条目的值，驱动节点据此取消延迟操作
pub const REMEDIATION_REQUESTED: &str = "REMEDIATION_REQUESTED";

/// 分区映射的本地条目生命周期回调
///
/// 只有当前拥有键所在分区的节点会收到回调。实现不能长时间阻塞，
/// 耗时工作需要交给独立的任务。
#[async_trait]
pub trait EntryListener: Send + Sync {
    async fn entry_added(&self, key: &str, value: &str);
    async fn entry_updated(&self, key: &str, old_value: &str, value: &str);
    async fn entry_removed(&self, key: &str);
    async fn entry_evicted(&self, key: &str);
}

/// 集群范围的所有权映射，绑定到某一个节点的视角
#[async_trait]
pub trait OwnershipMap: Send + Sync {
    fn local_node_id(&self) -> &str;

    /// 幂等的插入或替换
    async fn add_or_update(&self, key: &str, value: &str) -> OrchestratorResult<()>;
    async fn remove(&self, key: &str) -> OrchestratorResult<bool>;
    async fn get(&self, key: &str) -> OrchestratorResult<Option<String>>;
    async fn is_locally_owned(&self, key: &str) -> OrchestratorResult<bool>;
    async fn is_member(&self, node_id: &str) -> OrchestratorResult<bool>;

    /// 在节点亲和表中记录本节点正在驱动该任务
    async fn claim(&self, key: &str) -> OrchestratorResult<()>;
    /// 从节点亲和表中移除该任务
    async fn release(&self, key: &str) -> OrchestratorResult<()>;
    async fn driving_node(&self, key: &str) -> OrchestratorResult<Option<String>>;
}
