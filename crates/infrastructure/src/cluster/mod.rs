//! 进程内分区所有权映射
//!
//! 键被哈希到固定数量的分区上，每个分区恰好属于一个存活成员。
//! 条目生命周期回调只投递给拥有该键所在分区的成员。

pub mod in_memory_cluster;
pub mod partition;

pub use in_memory_cluster::{ClusterNode, InMemoryCluster};
pub use partition::PartitionTable;
