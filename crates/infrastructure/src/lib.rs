pub mod cluster;
pub mod database;
pub mod event_bus;
pub mod in_memory_task_repository;
pub mod local_executor;

pub use cluster::{ClusterNode, InMemoryCluster, PartitionTable};
pub use database::*;
pub use event_bus::BroadcastEventBus;
pub use in_memory_task_repository::InMemoryTaskRepository;
pub use local_executor::{EmbeddedCommandBuilder, LocalCommandExecutor, LocalEndpointConnector};
