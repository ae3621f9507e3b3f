use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::entities::ServiceDescriptor;

/// 本地服务注册表（只读）
///
/// 服务的探测与维护由外部协作方负责，本系统只做查询，
/// 并通过变更通道在服务列表变化时触发重新公告。
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// 按服务ID查询
    async fn get(&self, service_id: &str) -> Option<ServiceDescriptor>;

    /// 当前正在运行的全部服务
    async fn running_services(&self) -> Vec<ServiceDescriptor>;

    /// 订阅服务列表变更事件
    fn subscribe_changes(&self) -> broadcast::Receiver<()>;
}
