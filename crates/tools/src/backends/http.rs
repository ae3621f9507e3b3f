use std::time::Duration;

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use serde_json::{Map, Value};
use tracing::info;

use crate::backend::ToolBackend;
use crate::chat::ToolDefinition;

/// HTTP工具端点
#[derive(Debug, Clone)]
pub struct HttpToolEndpoint {
    pub definition: ToolDefinition,
    pub url: String,
    pub bearer_token: Option<String>,
}

/// HTTP工具后端
///
/// 以JSON POST调用外部服务，可选Bearer鉴权。
pub struct HttpToolBackend {
    endpoints: Vec<HttpToolEndpoint>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpToolBackend {
    pub fn new(endpoints: Vec<HttpToolEndpoint>, timeout: Duration) -> Self {
        Self {
            endpoints,
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.endpoints.iter().map(|e| e.definition.clone()).collect()
    }

    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.definition.name() == name)
            .ok_or_else(|| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: "未注册的工具".to_string(),
            })?;

        let mut request = self
            .client
            .post(&endpoint.url)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "name": name,
                "arguments": arguments,
            }));
        if let Some(token) = &endpoint.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("HTTP调用失败: {e}"),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("读取工具响应失败: {e}"),
            })?;

        if !status.is_success() {
            return Err(RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("HTTP工具返回状态码 {status}: {text}"),
            });
        }

        info!(tool = name, status = %status, "HTTP工具执行完成");
        Ok(text)
    }
}
