use std::sync::Arc;

use async_trait::async_trait;
use relay_domain::entities::ServiceDescriptor;
use relay_domain::ports::ServiceRegistry;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// 静态服务注册表
///
/// 服务探测由外部协作方完成后通过`set_services`灌入；
/// 每次变更都会广播通知，供在线公告立即刷新。
pub struct StaticServiceRegistry {
    services: Arc<RwLock<Vec<ServiceDescriptor>>>,
    change_tx: broadcast::Sender<()>,
}

impl StaticServiceRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            services: Arc::new(RwLock::new(services)),
            change_tx,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// 整体替换服务列表并广播变更
    pub async fn set_services(&self, services: Vec<ServiceDescriptor>) {
        info!(count = services.len(), "本地服务列表已更新");
        *self.services.write().await = services;
        let _ = self.change_tx.send(());
    }
}

#[async_trait]
impl ServiceRegistry for StaticServiceRegistry {
    async fn get(&self, service_id: &str) -> Option<ServiceDescriptor> {
        self.services
            .read()
            .await
            .iter()
            .find(|svc| svc.id == service_id)
            .cloned()
    }

    async fn running_services(&self) -> Vec<ServiceDescriptor> {
        self.services
            .read()
            .await
            .iter()
            .filter(|svc| svc.is_running)
            .cloned()
            .collect()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use relay_domain::entities::{ApiFormat, ServiceKind};

    use super::*;

    fn svc(id: &str, running: bool) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            kind: ServiceKind::Generic,
            port: 8000,
            api_format: ApiFormat::Plain,
            is_running: running,
            base_url: None,
            workflows: None,
        }
    }

    #[tokio::test]
    async fn test_lookup_and_running_filter() {
        let registry = StaticServiceRegistry::new(vec![svc("a", true), svc("b", false)]);
        assert!(registry.get("a").await.is_some());
        assert!(registry.get("missing").await.is_none());
        let running = registry.running_services().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");
    }

    #[tokio::test]
    async fn test_change_broadcast() {
        let registry = StaticServiceRegistry::empty();
        let mut rx = registry.subscribe_changes();
        registry.set_services(vec![svc("a", true)]).await;
        assert!(rx.recv().await.is_ok());
    }
}
