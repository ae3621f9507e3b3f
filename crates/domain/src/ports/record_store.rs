//! 记录存储接口定义
//!
//! 共享持久存储的抽象，双方设备均无法直接互连，全部协调经由该存储。
//! 实现必须在适配层内部消化"类型尚未建表"一类的首次使用错误：
//! 读路径视同空结果，写路径惰性建表，上层永远不感知存储的初始化状态。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::Result;

use crate::entities::{DeviceAnnouncement, DeviceKind, RelayRequest, RelayResponse, RequestStatus};

/// 请求记录仓储接口
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// 保存请求（按ID覆盖写）
    async fn save(&self, request: &RelayRequest) -> Result<()>;

    /// 按ID查询
    async fn get_by_id(&self, id: &str) -> Result<Option<RelayRequest>>;

    /// 更新请求状态
    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()>;

    /// 查询指定设备的全部待处理请求，按创建时间升序
    async fn list_pending_for_device(&self, device_id: &str) -> Result<Vec<RelayRequest>>;

    /// 删除请求
    async fn delete(&self, id: &str) -> Result<()>;

    /// 删除早于截止时间的已完结请求，PENDING状态的请求永不删除
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize>;
}

/// 响应记录仓储接口
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn save(&self, response: &RelayResponse) -> Result<()>;

    /// 按请求ID查询响应，同一请求以最先写入的一条为准
    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<RelayResponse>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// 删除早于截止时间的响应
    async fn delete_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize>;
}

/// 设备公告仓储接口
#[async_trait]
pub trait AnnouncementStore: Send + Sync {
    /// 按设备ID原地覆盖写入
    async fn upsert(&self, announcement: &DeviceAnnouncement) -> Result<()>;

    async fn get(&self, device_id: &str) -> Result<Option<DeviceAnnouncement>>;

    /// 查询指定类型的全部公告，按last_seen_at降序
    async fn list_by_kind(&self, kind: DeviceKind) -> Result<Vec<DeviceAnnouncement>>;

    async fn delete(&self, device_id: &str) -> Result<()>;
}
