use std::sync::Arc;
use std::time::Duration;

use relay_core::{RelayError, Result};
use relay_domain::entities::{RelayRequest, ServiceDescriptor};
use tracing::{debug, info, warn};

use crate::backend::ToolRegistry;
use crate::chat::{
    extract_assistant_message, tool_calls_of, ChatMessage, ChatRequestBody, ToolCallInstruction,
};

/// 工具调用编排器
///
/// 检查聊天补全响应中的工具调用指令，逐个执行后把结果并回
/// 会话并同步发起一次后续调用。设计上只做一轮：后续调用的
/// 响应即使再次携带工具调用也原样返回，不递归执行。
/// 任何环节失败都降级为返回原始响应体，中继永远有内容可回。
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    client: reqwest::Client,
    /// 后续调用超时，与首轮转发同样宽松
    follow_up_timeout: Duration,
    /// 单个工具调用超时
    tool_timeout: Duration,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        follow_up_timeout: Duration,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            follow_up_timeout,
            tool_timeout,
        }
    }

    /// 该服务是否需要注入工具定义（按服务逐个判定，不是全局开关）
    pub fn should_inject_tools(&self, service: &ServiceDescriptor) -> bool {
        service.is_tool_capable()
    }

    /// 向出站请求体注入tools与tool_choice字段
    ///
    /// 非JSON或非对象的请求体原样放行；无可用工具时不做修改。
    pub fn inject_tools(&self, body: &[u8]) -> Vec<u8> {
        let definitions = self.registry.definitions();
        if definitions.is_empty() {
            return body.to_vec();
        }
        let mut parsed: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => return body.to_vec(),
        };
        let obj = match parsed.as_object_mut() {
            Some(obj) => obj,
            None => return body.to_vec(),
        };
        obj.insert(
            "tools".to_string(),
            serde_json::to_value(&definitions).unwrap_or_default(),
        );
        obj.insert(
            "tool_choice".to_string(),
            serde_json::Value::String("auto".to_string()),
        );
        match serde_json::to_vec(&parsed) {
            Ok(bytes) => {
                debug!(tools = definitions.len(), "已注入工具定义");
                bytes
            }
            Err(_) => body.to_vec(),
        }
    }

    /// 响应钩子：有工具调用则执行并返回后续调用的结果，否则原样返回
    pub async fn handle_response(
        &self,
        raw_body: &[u8],
        request: &RelayRequest,
        service: &ServiceDescriptor,
    ) -> Vec<u8> {
        match self.run_tool_round(raw_body, request, service).await {
            Ok(Some(final_body)) => final_body,
            Ok(None) => raw_body.to_vec(),
            Err(e) => {
                warn!("工具回合失败，返回原始响应: {e}");
                raw_body.to_vec()
            }
        }
    }

    async fn run_tool_round(
        &self,
        raw_body: &[u8],
        request: &RelayRequest,
        service: &ServiceDescriptor,
    ) -> Result<Option<Vec<u8>>> {
        let assistant = match extract_assistant_message(raw_body) {
            Some(message) => message,
            None => return Ok(None),
        };
        let calls = tool_calls_of(&assistant).to_vec();
        if calls.is_empty() {
            return Ok(None);
        }

        info!(count = calls.len(), request_id = %request.id, "响应携带工具调用");

        // 逐个执行，单个失败降级为占位结果，不中断整批
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            results.push(self.execute_single(call).await);
        }

        // 原会话 + 助手工具调用轮 + 每个调用一条结果轮
        let original = request.body.as_deref().ok_or_else(|| {
            RelayError::InvalidResponse("原始请求缺少请求体".to_string())
        })?;
        let mut follow_up = ChatRequestBody::parse(original)?;
        follow_up.messages.push(assistant);
        for (call, result) in calls.iter().zip(results) {
            follow_up.messages.push(ChatMessage::Tool {
                content: result,
                tool_call_id: call.id.clone(),
            });
        }
        // 移除工具字段，后续调用不再进入工具分支
        follow_up.strip_tool_fields();

        let url = format!("{}{}", service.effective_base_url(), request.endpoint);
        let mut http_request = self
            .client
            .post(&url)
            .timeout(self.follow_up_timeout)
            .body(follow_up.to_bytes()?);
        for (key, value) in &request.headers {
            if key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            http_request = http_request.header(key, value);
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| RelayError::ServiceUnreachable(format!("后续调用失败: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::ServiceUnreachable(format!("读取后续响应失败: {e}")))?;

        info!(
            status = %status,
            request_id = %request.id,
            "工具后续调用完成"
        );
        Ok(Some(bytes.to_vec()))
    }

    async fn execute_single(&self, call: &ToolCallInstruction) -> String {
        let name = &call.function.name;
        let arguments = call.function.parsed_arguments();
        let outcome =
            tokio::time::timeout(self.tool_timeout, self.registry.execute(name, &arguments)).await;
        match outcome {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(tool = %name, "工具执行失败: {e}");
                format!("工具执行失败: {e}")
            }
            Err(_) => {
                warn!(tool = %name, "工具执行超时");
                format!("工具执行超时 ({:?})", self.tool_timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::routing::post;
    use axum::Router;
    use relay_domain::entities::{ApiFormat, ServiceKind};
    use serde_json::{Map, Value};

    use super::*;
    use crate::backend::ToolBackend;
    use crate::chat::ToolDefinition;

    struct CountingBackend {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ToolBackend for CountingBackend {
        fn definitions(&self) -> Vec<ToolDefinition> {
            vec![ToolDefinition::function(
                "lookup",
                "测试工具",
                serde_json::json!({"type": "object", "properties": {}}),
            )]
        }

        async fn execute(&self, name: &str, _arguments: &Map<String, Value>) -> relay_core::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RelayError::ToolExecutionFailed {
                    name: name.to_string(),
                    message: "后端故障".to_string(),
                })
            } else {
                Ok("RESULT".to_string())
            }
        }
    }

    fn orchestrator_with(fail: bool) -> (ToolOrchestrator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingBackend {
            calls: calls.clone(),
            fail,
        }));
        (
            ToolOrchestrator::new(
                Arc::new(registry),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ),
            calls,
        )
    }

    fn tool_call_response() -> Vec<u8> {
        serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":\"天气\"}"}
                    }]
                }
            }]
        })
        .to_string()
        .into_bytes()
    }

    fn chat_request(base_url: &str) -> (RelayRequest, ServiceDescriptor) {
        let body = serde_json::json!({
            "model": "qwen3",
            "messages": [{"role": "user", "content": "今天天气如何"}],
            "tools": [],
            "tool_choice": "auto"
        })
        .to_string()
        .into_bytes();
        let request = RelayRequest::new(
            "svc-llm",
            "ollama",
            "/v1/chat/completions",
            "POST",
            HashMap::new(),
            Some(body),
            "desktop-1",
        );
        let service = ServiceDescriptor {
            id: "svc-llm".to_string(),
            name: "ollama".to_string(),
            kind: ServiceKind::LanguageModel,
            port: 11434,
            api_format: ApiFormat::ChatCompletions,
            is_running: true,
            base_url: Some(base_url.to_string()),
            workflows: None,
        };
        (request, service)
    }

    /// 记录后续调用请求体并返回固定最终应答的mock服务
    async fn spawn_chat_mock(reply: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move |body: String| {
                let seen = seen_clone.clone();
                let reply = reply.clone();
                async move {
                    seen.lock()
                        .unwrap()
                        .push(serde_json::from_str(&body).unwrap());
                    reply.to_string()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn test_follow_up_message_shape() {
        let final_reply =
            serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "晴天"}}]});
        let (base, seen) = spawn_chat_mock(final_reply.clone()).await;
        let (orchestrator, calls) = orchestrator_with(false);
        let (request, service) = chat_request(&base);

        let result = orchestrator
            .handle_response(&tool_call_response(), &request, &service)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let result: Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(result, final_reply);

        // 后续请求体 = 原会话 + 助手工具调用轮 + 工具结果轮
        let recorded = seen.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        let follow_up = &recorded[0];
        let messages = follow_up["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_9");
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_9");
        assert_eq!(messages[2]["content"], "RESULT");
        // 工具字段必须被剥除，阻止二次进入工具分支
        assert!(follow_up.get("tools").is_none());
        assert!(follow_up.get("tool_choice").is_none());
        assert_eq!(follow_up["model"], "qwen3");
    }

    #[tokio::test]
    async fn test_failed_tool_yields_placeholder_result() {
        let final_reply =
            serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]});
        let (base, seen) = spawn_chat_mock(final_reply).await;
        let (orchestrator, calls) = orchestrator_with(true);
        let (request, service) = chat_request(&base);

        let _ = orchestrator
            .handle_response(&tool_call_response(), &request, &service)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let recorded = seen.lock().unwrap();
        let messages = recorded[0]["messages"].as_array().unwrap();
        let tool_turn = messages.last().unwrap();
        assert_eq!(tool_turn["role"], "tool");
        assert!(tool_turn["content"]
            .as_str()
            .unwrap()
            .contains("工具执行失败"));
    }

    #[tokio::test]
    async fn test_no_tool_calls_passes_through() {
        let (orchestrator, calls) = orchestrator_with(false);
        let (request, service) = chat_request("http://127.0.0.1:1");

        let raw =
            br#"{"choices":[{"message":{"role":"assistant","content":"plain answer"}}]}"#.to_vec();
        let result = orchestrator.handle_response(&raw, &request, &service).await;
        assert_eq!(result, raw);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_body_passes_through_unchanged() {
        let (orchestrator, _) = orchestrator_with(false);
        let (request, service) = chat_request("http://127.0.0.1:1");

        let raw = b"\xff\xfenot json at all".to_vec();
        let result = orchestrator.handle_response(&raw, &request, &service).await;
        assert_eq!(result, raw);
    }

    #[tokio::test]
    async fn test_follow_up_failure_returns_original() {
        // 指向必然拒绝连接的端口
        let (orchestrator, calls) = orchestrator_with(false);
        let (request, service) = chat_request("http://127.0.0.1:1");

        let raw = tool_call_response();
        let result = orchestrator.handle_response(&raw, &request, &service).await;
        assert_eq!(result, raw);
        // 工具仍然执行了，只是后续调用失败后降级
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exactly_one_round_no_recursion() {
        // 后续调用的应答再次要求工具调用，设计上不再执行
        let second_round = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_10",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{}"}
                    }]
                }
            }]
        });
        let (base, _seen) = spawn_chat_mock(second_round.clone()).await;
        let (orchestrator, calls) = orchestrator_with(false);
        let (request, service) = chat_request(&base);

        let result = orchestrator
            .handle_response(&tool_call_response(), &request, &service)
            .await;

        // 只执行了首轮的一次工具调用
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // 第二轮指令原样透出给客户端
        let result: Value = serde_json::from_slice(&result).unwrap();
        assert_eq!(result, second_round);
    }

    #[tokio::test]
    async fn test_inject_tools_sets_fields() {
        let (orchestrator, _) = orchestrator_with(false);
        let body = br#"{"model":"qwen3","messages":[]}"#;
        let injected = orchestrator.inject_tools(body);
        let parsed: Value = serde_json::from_slice(&injected).unwrap();
        assert_eq!(parsed["tool_choice"], "auto");
        assert_eq!(parsed["tools"][0]["function"]["name"], "lookup");
    }

    #[tokio::test]
    async fn test_inject_tools_tolerates_non_json() {
        let (orchestrator, _) = orchestrator_with(false);
        let body = b"just some bytes";
        assert_eq!(orchestrator.inject_tools(body), body.to_vec());
    }

    #[tokio::test]
    async fn test_inject_tools_noop_when_registry_empty() {
        let orchestrator = ToolOrchestrator::new(
            Arc::new(ToolRegistry::new()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let body = br#"{"messages":[]}"#;
        assert_eq!(orchestrator.inject_tools(body), body.to_vec());
    }

    #[tokio::test]
    async fn test_should_inject_only_for_chat_services() {
        let (orchestrator, _) = orchestrator_with(false);
        let (_, mut service) = chat_request("http://x");
        assert!(orchestrator.should_inject_tools(&service));

        service.api_format = ApiFormat::Plain;
        assert!(!orchestrator.should_inject_tools(&service));
    }
}
