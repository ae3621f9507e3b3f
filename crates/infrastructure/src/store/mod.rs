//! 记录存储实现
//!
//! SQLite实现用于持久部署，内存实现用于测试与嵌入式场景。
//! 两者在序列化边界上对超限的二进制体做Blob引用路由，调用方不感知。

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use relay_core::{RelayError, Result};

/// 请求/响应头序列化为内嵌JSON字符串（存储无原生map字段）
pub(crate) fn headers_to_json(headers: &HashMap<String, String>) -> Result<String> {
    serde_json::to_string(headers).map_err(|e| RelayError::Serialization(e.to_string()))
}

pub(crate) fn headers_from_json(text: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(text).map_err(|e| RelayError::Serialization(e.to_string()))
}
