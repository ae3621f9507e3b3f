use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use relay_core::{RelayError, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::ToolBackend;
use crate::chat::ToolDefinition;

/// 文件系统内置工具后端
///
/// 读/写/列目录三个兜底工具，全部限定在配置的根目录之内，
/// 越界路径一律拒绝。
pub struct FsToolBackend {
    root: PathBuf,
}

impl FsToolBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 解析相对路径并拒绝逃逸
    fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let path = Path::new(raw);
        if path.is_absolute() {
            return Err(RelayError::ToolExecutionFailed {
                name: "fs".to_string(),
                message: format!("拒绝绝对路径: {raw}"),
            });
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(RelayError::ToolExecutionFailed {
                        name: "fs".to_string(),
                        message: format!("拒绝越界路径: {raw}"),
                    })
                }
            }
        }
        Ok(self.root.join(path))
    }

    fn str_arg<'a>(arguments: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
        arguments
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::ToolExecutionFailed {
                name: "fs".to_string(),
                message: format!("缺少参数: {key}"),
            })
    }

    async fn read(&self, arguments: &Map<String, Value>) -> Result<String> {
        let path = self.resolve(Self::str_arg(arguments, "path")?)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: "fs_read".to_string(),
                message: format!("读取 {} 失败: {e}", path.display()),
            })
    }

    async fn write(&self, arguments: &Map<String, Value>) -> Result<String> {
        let path = self.resolve(Self::str_arg(arguments, "path")?)?;
        let content = Self::str_arg(arguments, "content")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: "fs_write".to_string(),
                message: format!("写入 {} 失败: {e}", path.display()),
            })?;
        debug!(path = %path.display(), bytes = content.len(), "文件已写入");
        Ok(format!("已写入 {} 字节", content.len()))
    }

    async fn list(&self, arguments: &Map<String, Value>) -> Result<String> {
        let raw = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let path = self.resolve(raw)?;
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| RelayError::ToolExecutionFailed {
                name: "fs_list".to_string(),
                message: format!("列目录 {} 失败: {e}", path.display()),
            })?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            RelayError::ToolExecutionFailed {
                name: "fs_list".to_string(),
                message: format!("读取目录项失败: {e}"),
            }
        })? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

#[async_trait]
impl ToolBackend for FsToolBackend {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "fs_read",
                "读取根目录内的文本文件",
                serde_json::json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            ),
            ToolDefinition::function(
                "fs_write",
                "写入根目录内的文本文件",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    },
                    "required": ["path", "content"]
                }),
            ),
            ToolDefinition::function(
                "fs_list",
                "列出根目录内的子目录内容",
                serde_json::json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}}
                }),
            ),
        ]
    }

    async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> Result<String> {
        match name {
            "fs_read" => self.read(arguments).await,
            "fs_write" => self.write(arguments).await,
            "fs_list" => self.list(arguments).await,
            _ => Err(RelayError::ToolExecutionFailed {
                name: name.to_string(),
                message: "未注册的工具".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_write_then_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsToolBackend::new(dir.path());

        let result = backend
            .execute("fs_write", &args(&[("path", "notes/a.txt"), ("content", "你好")]))
            .await
            .unwrap();
        assert!(result.contains("字节"));

        let content = backend
            .execute("fs_read", &args(&[("path", "notes/a.txt")]))
            .await
            .unwrap();
        assert_eq!(content, "你好");

        let listing = backend
            .execute("fs_list", &args(&[("path", "notes")]))
            .await
            .unwrap();
        assert_eq!(listing, "a.txt");
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsToolBackend::new(dir.path());

        assert!(backend
            .execute("fs_read", &args(&[("path", "../outside.txt")]))
            .await
            .is_err());
        assert!(backend
            .execute("fs_read", &args(&[("path", "/etc/passwd")]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsToolBackend::new(dir.path());
        assert!(backend.execute("fs_read", &Map::new()).await.is_err());
    }
}
