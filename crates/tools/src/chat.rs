//! 聊天补全协议的wire类型
//!
//! 工具调用相关的请求体/响应体只在JSON边界解析为强类型的
//! 标签联合，内部逻辑不操作裸字典。无法解析的内容按原样放行，
//! 由编排层负责降级。

use relay_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 会话消息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallInstruction>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

/// 单条工具调用指令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallInstruction {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

/// 被调用的函数与其参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// JSON编码的参数串
    #[serde(default)]
    pub arguments: String,
}

impl FunctionCall {
    /// 解析参数串，空串与非对象内容均回落为空参数表
    pub fn parsed_arguments(&self) -> Map<String, Value> {
        if self.arguments.trim().is_empty() {
            return Map::new();
        }
        match serde_json::from_str::<Value>(&self.arguments) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn function_type() -> String {
    "function".to_string()
}

/// 对外公布的工具定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// 聊天补全请求体
///
/// `extra`保留model、temperature等未知字段原样透传。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestBody {
    pub messages: Vec<ChatMessage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequestBody {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| RelayError::InvalidResponse(format!("聊天请求体解析失败: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 移除工具相关字段，阻止后续调用再次进入工具分支
    pub fn strip_tool_fields(&mut self) {
        self.extra.remove("tools");
        self.extra.remove("tool_choice");
    }
}

/// 聊天补全响应中的首条消息
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// 从响应体中提取助手消息
///
/// 不是可识别的聊天补全响应时返回None，调用方按原样放行。
pub fn extract_assistant_message(raw: &[u8]) -> Option<ChatMessage> {
    let response: ChatCompletionResponse = serde_json::from_slice(raw).ok()?;
    response.choices.into_iter().next().map(|c| c.message)
}

/// 从助手消息中取出工具调用指令
pub fn tool_calls_of(message: &ChatMessage) -> &[ToolCallInstruction] {
    match message {
        ChatMessage::Assistant { tool_calls, .. } => tool_calls,
        _ => &[],
    }
}
