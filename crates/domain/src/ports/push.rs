use async_trait::async_trait;
use relay_core::Result;
use tokio::sync::broadcast;

use crate::events::RecordEvent;

/// 推送通知通道抽象
///
/// 尽力而为的记录变更通知。实现可以静默丢弃事件；
/// 订阅方必须同时运行轮询兜底，推送完全失效时系统仍需正确。
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// 发布记录变更事件，失败只记日志不上抛
    async fn publish(&self, event: RecordEvent) -> Result<()>;

    /// 订阅记录变更事件
    fn subscribe(&self) -> broadcast::Receiver<RecordEvent>;
}
