use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::helper::TaskHelper;

pub type HelperFactory = Arc<dyn Fn() -> Arc<dyn TaskHelper> + Send + Sync>;

/// 扩展名到任务执行协议实现的注册表
///
/// 启动时注册内置扩展，插件可以在运行期增量注册。工厂在第一次解析时调用，
/// 之后复用同一个实例。
#[derive(Clone, Default)]
pub struct HelperRegistry {
    helpers: Arc<RwLock<HashMap<String, Arc<dyn TaskHelper>>>>,
    factories: Arc<RwLock<HashMap<String, HelperFactory>>>,
}

impl HelperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, helper: Arc<dyn TaskHelper>) {
        let name = helper.extension_name().to_string();
        let mut helpers = self.helpers.write().await;
        if helpers.insert(name.clone(), helper).is_some() {
            warn!("扩展 {} 被重复注册，旧实现已被替换", name);
        } else {
            info!("注册任务扩展: {}", name);
        }
    }

    pub async fn register_factory(&self, extension_name: &str, factory: HelperFactory) {
        self.factories
            .write()
            .await
            .insert(extension_name.to_string(), factory);
        info!("注册任务扩展工厂: {}", extension_name);
    }

    pub async fn get(&self, extension_name: &str) -> Option<Arc<dyn TaskHelper>> {
        if let Some(helper) = self.helpers.read().await.get(extension_name) {
            return Some(Arc::clone(helper));
        }

        let factory = self.factories.read().await.get(extension_name).cloned()?;
        let mut helpers = self.helpers.write().await;
        let helper = helpers
            .entry(extension_name.to_string())
            .or_insert_with(|| factory());
        Some(Arc::clone(helper))
    }

    pub async fn contains(&self, extension_name: &str) -> bool {
        self.helpers.read().await.contains_key(extension_name)
            || self.factories.read().await.contains_key(extension_name)
    }

    pub async fn list_extensions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.helpers.read().await.keys().cloned().collect();
        for name in self.factories.read().await.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}
