use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backend::ToolBackend;
use crate::chat::ToolDefinition;

/// 一次性子进程工具
#[derive(Debug, Clone)]
pub struct SubprocessTool {
    pub definition: ToolDefinition,
    pub command: String,
    pub args: Vec<String>,
}

/// 一次性子进程工具后端
///
/// 每次调用拉起新进程：向stdin写入一行JSON请求，读取stdout
/// 直到进程退出作为结果。超时后进程被杀掉。
pub struct OneShotProcessBackend {
    tools: Vec<SubprocessTool>,
    timeout: Duration,
}

impl OneShotProcessBackend {
    pub fn new(tools: Vec<SubprocessTool>, timeout: Duration) -> Self {
        Self { tools, timeout }
    }
}

#[async_trait]
impl ToolBackend for OneShotProcessBackend {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.definition.name() == name)
            .ok_or_else(|| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: "未注册的工具".to_string(),
            })?;

        let request = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });

        let mut child = Command::new(&tool.command)
            .args(&tool.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("启动工具进程失败: {e}"),
            })?;

        // 写入单条请求后关闭stdin，进程以EOF为请求结束标志
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.to_string().as_bytes())
                .await
                .map_err(|e| RelayError::ToolExecutionFailed {
                    name: name.to_string(),
                    message: format!("写入工具请求失败: {e}"),
                })?;
            stdin.write_all(b"\n").await.ok();
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                // 超时路径：child已被move进wait_with_output并随future丢弃，
                // kill_on_drop负责回收进程
                warn!(tool = name, "工具进程超时被杀");
                RelayError::ToolExecutionFailed {
                    name: name.to_string(),
                    message: format!("工具执行超时 ({:?})", self.timeout),
                }
            })?
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("等待工具进程失败: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!(
                    "工具进程退出码 {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(tool = name, bytes = stdout.len(), "一次性工具执行完成");
        Ok(stdout)
    }
}
