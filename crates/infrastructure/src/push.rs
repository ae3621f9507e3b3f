//! 推送通知通道实现
//!
//! 推送只是加速手段，不是正确性来源：任何实现都允许丢事件，
//! 轮询兜底必须独立保证收敛。

use async_trait::async_trait;
use relay_core::Result;
use relay_domain::events::RecordEvent;
use relay_domain::ports::PushChannel;
use tokio::sync::broadcast;
use tracing::debug;

/// 进程内广播推送通道
///
/// 基于tokio broadcast，无接收者或通道滞后时事件直接丢弃。
pub struct InProcessPushChannel {
    tx: broadcast::Sender<RecordEvent>,
}

impl InProcessPushChannel {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InProcessPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushChannel for InProcessPushChannel {
    async fn publish(&self, event: RecordEvent) -> Result<()> {
        // 无接收者时send返回错误，按尽力而为语义忽略
        if self.tx.send(event).is_err() {
            debug!("推送事件无接收者，已丢弃");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.tx.subscribe()
    }
}

/// 空推送通道
///
/// 模拟推送完全不可用的环境，订阅端永远收不到事件。
/// 用于验证纯轮询路径的正确性，也可用于禁用推送的部署。
pub struct NoopPushChannel {
    // 保留发送端防止接收端立刻观察到Closed
    _tx: broadcast::Sender<RecordEvent>,
}

impl NoopPushChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { _tx: tx }
    }
}

impl Default for NoopPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushChannel for NoopPushChannel {
    async fn publish(&self, _event: RecordEvent) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self._tx.subscribe()
    }
}
