use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::chat::ToolDefinition;

/// 工具后端接口
///
/// 一个后端可以承载多个具名工具（子进程工具服务器、文件系统
/// 内置工具组等）。执行失败返回结构化错误，由编排层降级为
/// 占位结果，永远不中断整批调用。
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// 该后端当前提供的工具定义
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// 执行具名工具
    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String>;
}

/// 工具注册表
///
/// 按注册顺序路由：第一个声明了该工具名的后端负责执行。
pub struct ToolRegistry {
    backends: Vec<Arc<dyn ToolBackend>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// 注册工具后端
    pub fn register(&mut self, backend: Arc<dyn ToolBackend>) {
        info!(
            tools = ?backend.definitions().iter().map(|d| d.name().to_string()).collect::<Vec<_>>(),
            "注册工具后端"
        );
        self.backends.push(backend);
    }

    /// 当前可用的全部工具定义
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.backends
            .iter()
            .flat_map(|backend| backend.definitions())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.iter().all(|b| b.definitions().is_empty())
    }

    /// 执行具名工具
    pub async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        for backend in &self.backends {
            if backend.definitions().iter().any(|d| d.name() == name) {
                return backend.execute(name, arguments).await;
            }
        }
        Err(RelayError::ToolExecutionFailed {
            name: name.to_string(),
            message: "未注册的工具".to_string(),
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend {
        name: String,
        reply: String,
    }

    #[async_trait]
    impl ToolBackend for FixedBackend {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::function(
                &self.name,
                "固定应答",
                serde_json::json!({"type": "object", "properties": {}}),
            )]
        }

        async fn execute(&self, _name: &str, _arguments: &Map<String, Value>) -> Result<String> {
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn test_routes_by_tool_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixedBackend {
            name: "alpha".to_string(),
            reply: "A".to_string(),
        }));
        registry.register(Arc::new(FixedBackend {
            name: "beta".to_string(),
            reply: "B".to_string(),
        }));

        assert_eq!(registry.definitions().len(), 2);
        assert!(!registry.is_empty());

        let result = registry.execute("beta", &Map::new()).await.unwrap();
        assert_eq!(result, "B");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error() {
        let registry = ToolRegistry::new();
        let result = registry.execute("ghost", &Map::new()).await;
        assert!(matches!(
            result,
            Err(RelayError::ToolExecutionFailed { .. })
        ));
    }
}
