use thiserror::Error;

/// 中继系统错误类型定义
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("数据库错误: {0}")]
    Store(#[from] sqlx::Error),

    #[error("记录未找到: {id}")]
    RecordNotFound { id: String },

    #[error("未连接到目标设备")]
    NotConnected,

    #[error("等待响应超时")]
    Timeout,

    #[error("请求写入失败: {0}")]
    SendFailed(String),

    #[error("响应格式无效: {0}")]
    InvalidResponse(String),

    #[error("服务未找到: {id}")]
    ServiceNotFound { id: String },

    #[error("服务不可达: {0}")]
    ServiceUnreachable(String),

    #[error("工具执行失败: {name} - {message}")]
    ToolExecutionFailed { name: String, message: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl RelayError {
    /// 判断错误是否值得在写入路径上重试一次
    pub fn is_retriable(&self) -> bool {
        matches!(self, RelayError::Store(_) | RelayError::SendFailed(_))
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::ServiceNotFound {
            id: "svc-1".to_string(),
        };
        assert_eq!(err.to_string(), "服务未找到: svc-1");

        let err = RelayError::Timeout;
        assert_eq!(err.to_string(), "等待响应超时");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(RelayError::SendFailed("io".to_string()).is_retriable());
        assert!(!RelayError::Timeout.is_retriable());
        assert!(!RelayError::NotConnected.is_retriable());
    }
}
