use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{RelayError, Result, ToolServerConfig};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::backend::ToolBackend;
use crate::chat::ToolDefinition;

/// 子进程JSON-RPC工具服务器后端
///
/// 每个服务器进程只有一条framed读循环，请求ID在单一连接上
/// 复用；每次调用独立超时。读循环观察到EOF或写入失败即标记
/// 进程死亡，下一次调用自动重新拉起。
pub struct ToolServerBackend {
    config: ToolServerConfig,
    call_timeout: Duration,
    state: Mutex<Option<ServerState>>,
    definitions: std::sync::RwLock<Vec<ToolDefinition>>,
}

#[derive(Clone)]
struct ServerState {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: Arc<AtomicU64>,
    reader_alive: Arc<AtomicBool>,
    // 持有子进程句柄，Arc归零时kill_on_drop回收进程
    _child: Arc<Mutex<Child>>,
}

impl ToolServerBackend {
    pub fn new(config: ToolServerConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
            state: Mutex::new(None),
            definitions: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// 预热连接（可选，execute也会按需拉起）
    pub async fn connect(&self) -> Result<()> {
        self.ensure_state().await.map(|_| ())
    }

    async fn ensure_state(&self) -> Result<ServerState> {
        let mut guard = self.state.lock().await;
        let needs_respawn = match guard.as_ref() {
            None => true,
            Some(s) => !s.reader_alive.load(Ordering::Relaxed),
        };
        if needs_respawn {
            if guard.is_some() {
                warn!(server = %self.config.name, "工具服务器进程已死，重新拉起");
            }
            let (state, definitions) = self.spawn().await?;
            *self.definitions.write().unwrap() = definitions;
            *guard = Some(state);
        }
        Ok(guard.as_ref().cloned().ok_or_else(|| {
            RelayError::Internal("工具服务器状态缺失".to_string())
        })?)
    }

    async fn spawn(&self) -> Result<(ServerState, Vec<ToolDefinition>)> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: self.config.name.clone(),
                message: format!("拉起工具服务器失败: {e}"),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            RelayError::Internal("工具服务器缺少stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::Internal("工具服务器缺少stdout".to_string())
        })?;

        // stderr后台透传到日志
        if let Some(stderr) = child.stderr.take() {
            let server = self.config.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = String::new();
                loop {
                    buf.clear();
                    match reader.read_line(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => debug!(server = %server, "stderr: {}", buf.trim()),
                    }
                }
            });
        }

        let mut reader = BufReader::new(stdout);

        // 初始化握手
        let init = serde_json::json!({
            "jsonrpc": "2.0", "id": 0, "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "relay", "version": "1.0.0"}
            }
        });
        Self::write_line(&mut stdin, &init, &self.config.name).await?;
        let _init_reply = Self::read_line(&mut reader, &self.config.name).await?;

        let initialized =
            serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        Self::write_line(&mut stdin, &initialized, &self.config.name).await?;

        // 读循环启动前同步获取工具清单
        let list = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        Self::write_line(&mut stdin, &list, &self.config.name).await?;
        let list_reply = Self::read_line(&mut reader, &self.config.name).await?;
        let definitions = parse_tool_list(&list_reply);
        info!(
            server = %self.config.name,
            tools = definitions.len(),
            "工具服务器已就绪"
        );

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let reader_alive = Arc::new(AtomicBool::new(true));

        let pending_clone = pending.clone();
        let alive_clone = reader_alive.clone();
        let server = self.config.name.clone();

        // 单条framed读循环，按响应ID分发给等待者
        tokio::spawn(async move {
            let mut buf = String::new();
            loop {
                buf.clear();
                match reader.read_line(&mut buf).await {
                    Ok(0) => {
                        warn!(server = %server, "工具服务器EOF，进程退出");
                        alive_clone.store(false, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        warn!(server = %server, "工具服务器读取错误: {e}");
                        alive_clone.store(false, Ordering::Relaxed);
                        break;
                    }
                    Ok(_) => {
                        if let Ok(reply) = serde_json::from_str::<Value>(buf.trim()) {
                            if let Some(id) = reply.get("id").and_then(|v| v.as_u64()) {
                                if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                    let _ = tx.send(reply);
                                }
                            }
                        }
                    }
                }
            }
            // 读循环退出后，挂起的等待者随sender析构收到取消
            pending_clone.lock().await.clear();
        });

        Ok((
            ServerState {
                stdin: Arc::new(Mutex::new(stdin)),
                pending,
                next_id: Arc::new(AtomicU64::new(2)),
                reader_alive,
                _child: Arc::new(Mutex::new(child)),
            },
            definitions,
        ))
    }

    async fn write_line(stdin: &mut ChildStdin, value: &Value, server: &str) -> Result<()> {
        let write_all = stdin.write_all(value.to_string().as_bytes()).await;
        let newline = stdin.write_all(b"\n").await;
        let flush = stdin.flush().await;
        write_all
            .and(newline)
            .and(flush)
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: server.to_string(),
                message: format!("写入工具服务器失败: {e}"),
            })
    }

    async fn read_line(
        reader: &mut BufReader<tokio::process::ChildStdout>,
        server: &str,
    ) -> Result<Value> {
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line))
            .await
            .map_err(|_| RelayError::ToolExecutionFailed {
                name: server.to_string(),
                message: "工具服务器握手超时".to_string(),
            })?
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: server.to_string(),
                message: format!("读取工具服务器失败: {e}"),
            })?;
        if n == 0 {
            return Err(RelayError::ToolExecutionFailed {
                name: server.to_string(),
                message: "工具服务器在握手期间退出".to_string(),
            });
        }
        serde_json::from_str(line.trim()).map_err(|e| RelayError::ToolExecutionFailed {
            name: server.to_string(),
            message: format!("工具服务器响应不是合法JSON: {e}"),
        })
    }
}

fn parse_tool_list(reply: &Value) -> Vec<ToolDefinition> {
    let tools = match reply.pointer("/result/tools").and_then(|v| v.as_array()) {
        Some(tools) => tools,
        None => return Vec::new(),
    };
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            let description = tool
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let parameters = tool
                .get("inputSchema")
                .or_else(|| tool.get("input_schema"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
            Some(ToolDefinition::function(name, description, parameters))
        })
        .collect()
}

#[async_trait]
impl ToolBackend for ToolServerBackend {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.read().unwrap().clone()
    }

    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        let state = self.ensure_state().await?;

        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.pending.lock().await.insert(id, tx);

        let request = serde_json::json!({
            "jsonrpc": "2.0", "id": id, "method": "tools/call",
            "params": {"name": name, "arguments": arguments}
        });

        let send_result = {
            let mut stdin = state.stdin.lock().await;
            let write_all = stdin.write_all(request.to_string().as_bytes()).await;
            let newline = stdin.write_all(b"\n").await;
            let flush = stdin.flush().await;
            write_all.and(newline).and(flush)
        };
        if let Err(e) = send_result {
            // 写入失败视为进程死亡，下次调用重新拉起
            state.reader_alive.store(false, Ordering::Relaxed);
            state.pending.lock().await.remove(&id);
            return Err(RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: format!("写入工具服务器失败: {e}"),
            });
        }

        let reply = match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(RelayError::ToolExecutionFailed {
                    name: name.to_string(),
                    message: "工具服务器连接已断开".to_string(),
                })
            }
            Err(_) => {
                state.pending.lock().await.remove(&id);
                return Err(RelayError::ToolExecutionFailed {
                    name: name.to_string(),
                    message: format!("工具调用超时 ({:?})", self.call_timeout),
                });
            }
        };

        if let Some(error) = reply.get("error") {
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("未知错误");
            return Err(RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: message.to_string(),
            });
        }

        Ok(extract_result_text(reply.get("result")))
    }
}

/// 从tools/call结果中抽取文本内容
fn extract_result_text(result: Option<&Value>) -> String {
    let result = match result {
        Some(result) => result,
        None => return String::new(),
    };
    if let Some(content) = result.get("content").and_then(|v| v.as_array()) {
        let texts: Vec<&str> = content
            .iter()
            .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    result.to_string()
}
