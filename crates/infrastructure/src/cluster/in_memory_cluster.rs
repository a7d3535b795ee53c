use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use chaos_core::{ClusterConfig, OrchestratorError, OrchestratorResult};
use chaos_domain::ports::{EntryListener, OwnershipMap};

use super::partition::PartitionTable;

#[derive(Debug, Clone)]
enum EntryEvent {
    Added { key: String, value: String },
    Updated {
        key: String,
        old_value: String,
        value: String,
    },
    Removed { key: String },
    Evicted { key: String },
}

#[derive(Debug)]
struct MapEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct Member {
    sender: mpsc::UnboundedSender<EntryEvent>,
    dispatcher: JoinHandle<()>,
}

/// 锁顺序固定为 entries -> members，node_tasks 不与其他锁同时持有
struct ClusterState {
    table: PartitionTable,
    entry_ttl: Option<Duration>,
    sweep_interval: Duration,
    entries: Mutex<HashMap<String, MapEntry>>,
    members: RwLock<BTreeMap<String, Member>>,
    /// 节点亲和表：节点 -> 正在驱动的任务
    node_tasks: RwLock<HashMap<String, HashSet<String>>>,
}

impl ClusterState {
    fn owner_in(&self, key: &str, members: &BTreeMap<String, Member>) -> Option<String> {
        self.table
            .owner_of(key, members.keys().map(String::as_str))
            .map(str::to_string)
    }

    fn dispatch(&self, members: &BTreeMap<String, Member>, owner: &str, event: EntryEvent) {
        match members.get(owner) {
            Some(member) => {
                if member.sender.send(event).is_err() {
                    warn!("节点 {} 的回调分发通道已关闭，事件被丢弃", owner);
                }
            }
            None => warn!("分区所有者 {} 不在成员列表中，事件被丢弃", owner),
        }
    }

    async fn dispatch_to_owner(&self, key: &str, event: EntryEvent) {
        let members = self.members.read().await;
        match self.owner_in(key, &members) {
            Some(owner) => self.dispatch(&members, &owner, event),
            None => warn!("集群中没有存活节点，键 {} 的事件被丢弃", key),
        }
    }
}

/// 进程内的分区所有权映射，模拟多个集群成员
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            state: Arc::new(ClusterState {
                table: PartitionTable::new(config.partition_count),
                entry_ttl: config.entry_ttl(),
                sweep_interval: config.eviction_sweep_interval(),
                entries: Mutex::new(HashMap::new()),
                members: RwLock::new(BTreeMap::new()),
                node_tasks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// 节点加入集群并注册本地监听器
    ///
    /// 所有者因此发生变化的键会在新所有者上触发一次 added 回调。
    pub async fn join(
        &self,
        node_id: &str,
        listener: Arc<dyn EntryListener>,
    ) -> OrchestratorResult<ClusterNode> {
        let entries = self.state.entries.lock().await;
        let mut members = self.state.members.write().await;
        if members.contains_key(node_id) {
            return Err(OrchestratorError::ownership(format!(
                "节点已在集群中: {node_id}"
            )));
        }

        let previous_owners: HashMap<&str, Option<String>> = entries
            .keys()
            .map(|key| (key.as_str(), self.state.owner_in(key, &members)))
            .collect();

        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(node_id.to_string(), listener, receiver);
        members.insert(node_id.to_string(), Member { sender, dispatcher });

        let migrated = self.redistribute(&entries, &members, &previous_owners);
        info!(
            "节点 {} 加入集群，当前成员数 {}，迁移条目 {}",
            node_id,
            members.len(),
            migrated
        );

        Ok(ClusterNode {
            node_id: node_id.to_string(),
            state: Arc::clone(&self.state),
        })
    }

    /// 获取某个节点的映射句柄，节点加入集群前句柄上的写操作会失败
    pub fn handle(&self, node_id: &str) -> ClusterNode {
        ClusterNode {
            node_id: node_id.to_string(),
            state: Arc::clone(&self.state),
        }
    }

    /// 节点离开集群（或宕机），尚未分发的回调随之丢失
    pub async fn leave(&self, node_id: &str) -> OrchestratorResult<()> {
        let entries = self.state.entries.lock().await;
        let mut members = self.state.members.write().await;

        let previous_owners: HashMap<&str, Option<String>> = entries
            .keys()
            .map(|key| (key.as_str(), self.state.owner_in(key, &members)))
            .collect();

        let member = members.remove(node_id).ok_or_else(|| {
            OrchestratorError::ownership(format!("节点不在集群中: {node_id}"))
        })?;
        member.dispatcher.abort();

        let migrated = self.redistribute(&entries, &members, &previous_owners);
        info!(
            "节点 {} 离开集群，剩余成员数 {}，迁移条目 {}",
            node_id,
            members.len(),
            migrated
        );
        Ok(())
    }

    fn redistribute(
        &self,
        entries: &HashMap<String, MapEntry>,
        members: &BTreeMap<String, Member>,
        previous_owners: &HashMap<&str, Option<String>>,
    ) -> usize {
        let mut migrated = 0;
        for (key, entry) in entries {
            let owner = self.state.owner_in(key, members);
            let previous = previous_owners.get(key.as_str()).cloned().flatten();
            if let Some(owner) = owner {
                if previous.as_deref() != Some(owner.as_str()) {
                    debug!("键 {} 的所有者从 {:?} 变为 {}", key, previous, owner);
                    self.state.dispatch(
                        members,
                        &owner,
                        EntryEvent::Added {
                            key: key.clone(),
                            value: entry.value.clone(),
                        },
                    );
                    migrated += 1;
                }
            }
        }
        migrated
    }

    pub async fn members(&self) -> Vec<String> {
        self.state.members.read().await.keys().cloned().collect()
    }

    pub async fn owner_of(&self, key: &str) -> Option<String> {
        let members = self.state.members.read().await;
        self.state.owner_in(key, &members)
    }

    pub fn partition_of(&self, key: &str) -> u32 {
        self.state.table.partition_of(key)
    }

    pub async fn entry_count(&self) -> usize {
        self.state.entries.lock().await.len()
    }

    /// 驱逐已过期的条目，返回驱逐数量
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.state.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let members = self.state.members.read().await;
        for key in &expired {
            entries.remove(key);
            match self.state.owner_in(key, &members) {
                Some(owner) => {
                    self.state
                        .dispatch(&members, &owner, EntryEvent::Evicted { key: key.clone() })
                }
                None => warn!("集群中没有存活节点，键 {} 的驱逐事件被丢弃", key),
            }
        }
        debug!("TTL 驱逐了 {} 个条目", expired.len());
        expired.len()
    }

    /// 启动 TTL 驱逐扫描，未配置 TTL 时返回 None
    pub fn start_eviction_sweeper(&self) -> Option<JoinHandle<()>> {
        self.state.entry_ttl?;
        let cluster = self.clone();
        let interval = self.state.sweep_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                cluster.evict_expired().await;
            }
        }))
    }
}

fn spawn_dispatcher(
    node_id: String,
    listener: Arc<dyn EntryListener>,
    mut receiver: mpsc::UnboundedReceiver<EntryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                EntryEvent::Added { key, value } => listener.entry_added(&key, &value).await,
                EntryEvent::Updated {
                    key,
                    old_value,
                    value,
                } => listener.entry_updated(&key, &old_value, &value).await,
                EntryEvent::Removed { key } => listener.entry_removed(&key).await,
                EntryEvent::Evicted { key } => listener.entry_evicted(&key).await,
            }
        }
        debug!("节点 {} 的回调分发循环已退出", node_id);
    })
}

/// 某个成员视角下的所有权映射
#[derive(Clone)]
pub struct ClusterNode {
    node_id: String,
    state: Arc<ClusterState>,
}

impl ClusterNode {
    async fn ensure_member(&self) -> OrchestratorResult<()> {
        if self.state.members.read().await.contains_key(&self.node_id) {
            Ok(())
        } else {
            Err(OrchestratorError::ownership(format!(
                "节点 {} 已不在集群中",
                self.node_id
            )))
        }
    }
}

#[async_trait]
impl OwnershipMap for ClusterNode {
    fn local_node_id(&self) -> &str {
        &self.node_id
    }

    async fn add_or_update(&self, key: &str, value: &str) -> OrchestratorResult<()> {
        self.ensure_member().await?;
        let expires_at = self.state.entry_ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.state.entries.lock().await;

        let event = match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                if entry.value == value {
                    None
                } else {
                    let old_value = std::mem::replace(&mut entry.value, value.to_string());
                    Some(EntryEvent::Updated {
                        key: key.to_string(),
                        old_value,
                        value: value.to_string(),
                    })
                }
            }
            None => {
                entries.insert(
                    key.to_string(),
                    MapEntry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
                Some(EntryEvent::Added {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
        };

        if let Some(event) = event {
            self.state.dispatch_to_owner(key, event).await;
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> OrchestratorResult<bool> {
        self.ensure_member().await?;
        let mut entries = self.state.entries.lock().await;
        if entries.remove(key).is_some() {
            self.state
                .dispatch_to_owner(key, EntryEvent::Removed { key: key.to_string() })
                .await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get(&self, key: &str) -> OrchestratorResult<Option<String>> {
        self.ensure_member().await?;
        let entries = self.state.entries.lock().await;
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn is_locally_owned(&self, key: &str) -> OrchestratorResult<bool> {
        let members = self.state.members.read().await;
        Ok(self.state.owner_in(key, &members).as_deref() == Some(self.node_id.as_str()))
    }

    async fn is_member(&self, node_id: &str) -> OrchestratorResult<bool> {
        Ok(self.state.members.read().await.contains_key(node_id))
    }

    async fn claim(&self, key: &str) -> OrchestratorResult<()> {
        let mut node_tasks = self.state.node_tasks.write().await;
        for (node, tasks) in node_tasks.iter_mut() {
            if node != &self.node_id {
                tasks.remove(key);
            }
        }
        node_tasks
            .entry(self.node_id.clone())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn release(&self, key: &str) -> OrchestratorResult<()> {
        let mut node_tasks = self.state.node_tasks.write().await;
        for tasks in node_tasks.values_mut() {
            tasks.remove(key);
        }
        node_tasks.retain(|_, tasks| !tasks.is_empty());
        Ok(())
    }

    async fn driving_node(&self, key: &str) -> OrchestratorResult<Option<String>> {
        let node_tasks = self.state.node_tasks.read().await;
        Ok(node_tasks
            .iter()
            .find(|(_, tasks)| tasks.contains(key))
            .map(|(node, _)| node.clone()))
    }
}
