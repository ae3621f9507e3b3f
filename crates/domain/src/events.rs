//! 中继事件
//!
//! 组件间通过显式事件通道解耦，不依赖隐式的可观察状态。

use serde::{Deserialize, Serialize};

/// 记录存储推送事件
///
/// 尽力而为：可能丢失、重复、延迟，正确性由轮询兜底保证。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordEvent {
    /// 新请求写入，携带目标设备ID用于订阅过滤
    RequestSaved {
        target_device_id: String,
        request_id: String,
    },
    /// 响应写入
    ResponseSaved {
        request_id: String,
        response_id: String,
    },
    /// 设备公告写入或更新
    AnnouncementSaved { device_id: String },
}

/// 本进程内的中继状态事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// 一次中继请求结束（成功或失败）
    RequestCompleted { request_id: String, success: bool },
    /// 本地服务列表发生变化
    ServiceListChanged,
}
