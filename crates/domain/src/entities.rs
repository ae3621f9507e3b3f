use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 中继请求
///
/// 由提交方创建并写入记录存储，处理方通过设备ID认领。
/// `id` 全局唯一且永不复用，创建时分配。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub endpoint: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub target_device_id: String,
    pub status: RequestStatus,
}

impl RelayRequest {
    /// 创建新的待处理请求，分配全新ID
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        target_device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            headers,
            body,
            created_at: Utc::now(),
            target_device_id: target_device_id.into(),
            status: RequestStatus::Pending,
        }
    }

    /// 请求是否已到达终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }
}

/// 请求状态
///
/// 预期推进顺序: pending → processing → {completed | failed | cancelled}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RequestStatus::Pending),
            "PROCESSING" => Ok(RequestStatus::Processing),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "CANCELLED" => Ok(RequestStatus::Cancelled),
            _ => Err(format!("Invalid request status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for RequestStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RequestStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RequestStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 中继响应
///
/// `request_id` 指向对应的请求；同一请求最多应存在一条有效响应，
/// 消费方以最先取到的一条为准。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub id: String,
    pub request_id: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_time_ms: u64,
}

impl RelayResponse {
    /// 创建成功响应
    pub fn new(
        request_id: impl Into<String>,
        status_code: u16,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            status_code,
            headers,
            body,
            error: None,
            created_at: Utc::now(),
            processing_time_ms,
        }
    }

    /// 创建错误响应，处理方失败时也必须写回一条响应
    pub fn error_response(
        request_id: impl Into<String>,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            status_code: 500,
            headers: HashMap::new(),
            body: None,
            error: Some(error.into()),
            created_at: Utc::now(),
            processing_time_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }
}

/// 设备类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceKind {
    #[serde(rename = "DESKTOP")]
    Desktop,
    #[serde(rename = "MOBILE")]
    Mobile,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Desktop => "DESKTOP",
            DeviceKind::Mobile => "MOBILE",
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DESKTOP" => Ok(DeviceKind::Desktop),
            "MOBILE" => Ok(DeviceKind::Mobile),
            _ => Err(format!("Invalid device kind: {s}")),
        }
    }
}

/// 设备在线公告
///
/// 每台设备一条记录，原地覆盖更新（读取-修改-写回），不追加。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub device_id: String,
    pub device_name: String,
    pub device_kind: DeviceKind,
    pub services: Vec<ServiceDescriptor>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
}

impl DeviceAnnouncement {
    /// 公告是否仍在有效窗口内
    pub fn is_fresh(&self, staleness_window_seconds: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_seen_at).num_seconds() <= staleness_window_seconds
    }
}

/// 服务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceKind {
    #[serde(rename = "LANGUAGE_MODEL")]
    LanguageModel,
    #[serde(rename = "IMAGE_GENERATION")]
    ImageGeneration,
    #[serde(rename = "GENERIC")]
    Generic,
}

/// 服务API协议
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiFormat {
    /// 聊天补全协议，支持工具调用注入
    #[serde(rename = "CHAT_COMPLETIONS")]
    ChatCompletions,
    /// 普通HTTP协议，原样转发
    #[serde(rename = "PLAIN")]
    Plain,
}

/// 本地服务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub kind: ServiceKind,
    pub port: u16,
    pub api_format: ApiFormat,
    pub is_running: bool,
    /// 显式远端地址，设置时优先于localhost:port
    pub base_url: Option<String>,
    /// 图像生成类服务附带的工作流清单
    pub workflows: Option<Vec<String>>,
}

impl ServiceDescriptor {
    /// 计算出站基础URL
    pub fn effective_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => format!("http://localhost:{}", self.port),
        }
    }

    /// 是否为支持工具注入的聊天补全服务
    pub fn is_tool_capable(&self) -> bool {
        self.kind == ServiceKind::LanguageModel && self.api_format == ApiFormat::ChatCompletions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_status_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Cancelled,
        ] {
            let parsed: RequestStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("RUNNING".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_new_request_is_pending_with_unique_id() {
        let a = RelayRequest::new(
            "svc", "服务", "/v1/chat", "POST", HashMap::new(), None, "dev-1",
        );
        let b = RelayRequest::new(
            "svc", "服务", "/v1/chat", "POST", HashMap::new(), None, "dev-1",
        );
        assert_eq!(a.status, RequestStatus::Pending);
        assert!(!a.is_terminal());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_effective_base_url() {
        let mut svc = ServiceDescriptor {
            id: "svc".to_string(),
            name: "ollama".to_string(),
            kind: ServiceKind::LanguageModel,
            port: 11434,
            api_format: ApiFormat::ChatCompletions,
            is_running: true,
            base_url: None,
            workflows: None,
        };
        assert_eq!(svc.effective_base_url(), "http://localhost:11434");
        svc.base_url = Some("http://192.168.1.5:8080".to_string());
        assert_eq!(svc.effective_base_url(), "http://192.168.1.5:8080");
    }

    #[test]
    fn test_tool_capable_requires_chat_format() {
        let svc = ServiceDescriptor {
            id: "svc".to_string(),
            name: "comfy".to_string(),
            kind: ServiceKind::ImageGeneration,
            port: 8188,
            api_format: ApiFormat::Plain,
            is_running: true,
            base_url: None,
            workflows: Some(vec!["portrait.json".to_string()]),
        };
        assert!(!svc.is_tool_capable());
    }

    #[test]
    fn test_announcement_freshness_window() {
        let now = Utc::now();
        let ann = DeviceAnnouncement {
            device_id: "dev-1".to_string(),
            device_name: "主机".to_string(),
            device_kind: DeviceKind::Desktop,
            services: vec![],
            last_seen_at: now - chrono::Duration::seconds(119),
            is_active: true,
        };
        assert!(ann.is_fresh(120, now));

        let stale = DeviceAnnouncement {
            last_seen_at: now - chrono::Duration::seconds(121),
            ..ann
        };
        assert!(!stale.is_fresh(120, now));
    }
}
