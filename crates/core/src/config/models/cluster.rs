use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "chaos-node".to_string())
}

/// 当前节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 集群内唯一的节点标识，默认取主机名
    pub node_id: String,
    /// 本进程内模拟的节点数量，仅用于单机演练
    pub local_members: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            local_members: 1,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(anyhow::anyhow!("节点ID不能为空"));
        }
        if self.local_members == 0 {
            return Err(anyhow::anyhow!("本地节点数量必须大于0"));
        }
        Ok(())
    }
}

/// 分区所有权映射配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// 分区数量，键通过稳定哈希映射到分区
    pub partition_count: u32,
    /// 条目存活时间（秒），0 表示不启用 TTL 驱逐
    pub entry_ttl_seconds: u64,
    /// TTL 驱逐扫描间隔（秒）
    pub eviction_sweep_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            entry_ttl_seconds: 0,
            eviction_sweep_interval_seconds: 30,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.partition_count == 0 {
            return Err(anyhow::anyhow!("分区数量必须大于0"));
        }
        if self.entry_ttl_seconds > 0 && self.eviction_sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("启用TTL时驱逐扫描间隔必须大于0"));
        }
        Ok(())
    }

    pub fn entry_ttl(&self) -> Option<Duration> {
        (self.entry_ttl_seconds > 0).then(|| Duration::from_secs(self.entry_ttl_seconds))
    }

    pub fn eviction_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_sweep_interval_seconds.max(1))
    }
}
