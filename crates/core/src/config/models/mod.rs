pub mod app_config;
pub mod cluster;
pub mod execution;
pub mod store_observability;

pub use app_config::AppConfig;
pub use cluster::{ClusterConfig, NodeConfig};
pub use execution::ExecutionConfig;
pub use store_observability::{ObservabilityConfig, StoreBackend, StoreConfig};
