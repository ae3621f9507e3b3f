//! 带外引导握手
//!
//! 通过二维码或粘贴文本交换的版本化载荷，仅用于为移动端
//! 播种初始的目标设备ID与服务列表，之后由在线公告接管。

use chrono::{DateTime, Utc};
use relay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};

use crate::entities::ServiceDescriptor;

/// 当前支持的握手协议版本
pub const HANDSHAKE_VERSION: u32 = 1;

/// 握手载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceDescriptor>>,
}

impl HandshakePayload {
    pub fn new(device_id: impl Into<String>, services: Option<Vec<ServiceDescriptor>>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            version: HANDSHAKE_VERSION,
            services,
        }
    }

    /// 编码为可嵌入二维码的JSON文本
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解析握手文本，拒绝无法理解的未来版本
    pub fn parse(text: &str) -> Result<Self> {
        let payload: HandshakePayload = serde_json::from_str(text.trim())
            .map_err(|e| RelayError::InvalidResponse(format!("握手载荷解析失败: {e}")))?;
        if payload.version > HANDSHAKE_VERSION {
            return Err(RelayError::InvalidResponse(format!(
                "不支持的握手版本: {}",
                payload.version
            )));
        }
        if payload.device_id.is_empty() {
            return Err(RelayError::InvalidResponse("握手载荷缺少设备ID".to_string()));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let payload = HandshakePayload::new("desktop-42", None);
        let text = payload.encode().unwrap();
        let parsed = HandshakePayload::parse(&text).unwrap();
        assert_eq!(parsed.device_id, "desktop-42");
        assert_eq!(parsed.version, HANDSHAKE_VERSION);
    }

    #[test]
    fn test_future_version_rejected() {
        let text = format!(
            r#"{{"device_id":"d","timestamp":"2026-01-01T00:00:00Z","version":{}}}"#,
            HANDSHAKE_VERSION + 1
        );
        assert!(HandshakePayload::parse(&text).is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let text = r#"{"device_id":"","timestamp":"2026-01-01T00:00:00Z","version":1}"#;
        assert!(HandshakePayload::parse(text).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(HandshakePayload::parse("not json at all").is_err());
    }
}
