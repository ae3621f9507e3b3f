use std::path::Path;

use anyhow::Result;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub store: StoreConfig,
    pub client: ClientConfig,
    pub worker: WorkerConfig,
    pub presence: PresenceConfig,
    pub retention: RetentionConfig,
    pub tools: ToolsConfig,
}

/// 本设备标识配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 设备唯一标识
    pub device_id: String,
    /// 设备显示名称
    pub device_name: String,
    /// 设备类型: "desktop" 或 "mobile"
    pub device_kind: String,
}

/// 记录存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite数据库URL
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
    /// 内联请求体大小上限（字节），超过则走Blob引用路径
    pub inline_body_limit: usize,
}

/// 客户端（请求提交方）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 响应轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 最大轮询次数
    pub max_poll_attempts: u32,
    /// 发现轮询间隔（秒）
    pub discovery_interval_seconds: u64,
    /// 连接后的发现轮询间隔（秒），慢于连接前
    pub connected_discovery_interval_seconds: u64,
}

/// Worker（请求处理方）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 待处理请求轮询间隔（秒）
    pub poll_interval_seconds: u64,
    /// 最大并发处理请求数
    pub max_concurrent_requests: usize,
    /// 转发本地HTTP服务的超时（秒），AI推理可能很慢
    pub request_timeout_seconds: u64,
    /// 静态注册的本地服务，动态探测由外部协作方负责
    #[serde(default)]
    pub services: Vec<ServiceEntryConfig>,
}

/// 静态注册的本地服务条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntryConfig {
    pub id: String,
    pub name: String,
    /// 服务类型: "language_model" / "image_generation" / "generic"
    pub kind: String,
    pub port: u16,
    /// API协议: "chat_completions" / "plain"
    #[serde(default)]
    pub api_format: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// 图像生成服务附带的工作流文件清单
    #[serde(default)]
    pub workflows: Option<Vec<String>>,
}

/// 在线状态公告配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// 公告刷新间隔（秒）
    pub announce_interval_seconds: u64,
    /// 公告过期窗口（秒），超过则视为离线
    pub staleness_window_seconds: i64,
}

/// 过期记录清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// 清理间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 记录保留时长（小时）
    pub retention_hours: i64,
    /// 每次清理的最大记录数
    pub max_batch_size: usize,
}

/// 工具执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub enabled: bool,
    /// 单个工具调用超时（秒）
    pub execution_timeout_seconds: u64,
    /// 文件系统内置工具的根目录，未设置则禁用内置工具
    pub fs_root: Option<String>,
    /// 子进程JSON-RPC工具服务器列表
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

/// 子进程工具服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                device_id: "desktop-001".to_string(),
                // 留空则在启动时回落为主机名
                device_name: String::new(),
                device_kind: "desktop".to_string(),
            },
            store: StoreConfig {
                database_url: "sqlite://relay.db?mode=rwc".to_string(),
                max_connections: 10,
                connection_timeout_seconds: 30,
                inline_body_limit: 900 * 1024,
            },
            client: ClientConfig {
                poll_interval_ms: 5000,
                max_poll_attempts: 60,
                discovery_interval_seconds: 10,
                connected_discovery_interval_seconds: 30,
            },
            worker: WorkerConfig {
                enabled: false,
                poll_interval_seconds: 5,
                max_concurrent_requests: 5,
                request_timeout_seconds: 300,
                services: Vec::new(),
            },
            presence: PresenceConfig {
                announce_interval_seconds: 30,
                staleness_window_seconds: 120,
            },
            retention: RetentionConfig {
                enabled: true,
                sweep_interval_seconds: 6 * 3600,
                retention_hours: 24,
                max_batch_size: 1000,
            },
            tools: ToolsConfig {
                enabled: true,
                execution_timeout_seconds: 10,
                fs_root: None,
                servers: Vec::new(),
            },
        }
    }
}

impl AppConfig {
    /// 加载配置
    ///
    /// 优先级：显式路径 > 默认路径 > 内置默认值，环境变量（RELAY__前缀）最后覆盖
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/relay.toml", "relay.toml", "/etc/relay/config.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let defaults = AppConfig::default();
        builder = builder
            .set_default("device.device_id", defaults.device.device_id)?
            .set_default("device.device_name", defaults.device.device_name)?
            .set_default("device.device_kind", defaults.device.device_kind)?
            .set_default("store.database_url", defaults.store.database_url)?
            .set_default("store.max_connections", defaults.store.max_connections)?
            .set_default(
                "store.connection_timeout_seconds",
                defaults.store.connection_timeout_seconds,
            )?
            .set_default(
                "store.inline_body_limit",
                defaults.store.inline_body_limit as u64,
            )?
            .set_default("client.poll_interval_ms", defaults.client.poll_interval_ms)?
            .set_default(
                "client.max_poll_attempts",
                defaults.client.max_poll_attempts,
            )?
            .set_default(
                "client.discovery_interval_seconds",
                defaults.client.discovery_interval_seconds,
            )?
            .set_default(
                "client.connected_discovery_interval_seconds",
                defaults.client.connected_discovery_interval_seconds,
            )?
            .set_default("worker.enabled", defaults.worker.enabled)?
            .set_default(
                "worker.poll_interval_seconds",
                defaults.worker.poll_interval_seconds,
            )?
            .set_default(
                "worker.max_concurrent_requests",
                defaults.worker.max_concurrent_requests as u64,
            )?
            .set_default(
                "worker.request_timeout_seconds",
                defaults.worker.request_timeout_seconds,
            )?
            .set_default(
                "presence.announce_interval_seconds",
                defaults.presence.announce_interval_seconds,
            )?
            .set_default(
                "presence.staleness_window_seconds",
                defaults.presence.staleness_window_seconds,
            )?
            .set_default("retention.enabled", defaults.retention.enabled)?
            .set_default(
                "retention.sweep_interval_seconds",
                defaults.retention.sweep_interval_seconds,
            )?
            .set_default("retention.retention_hours", defaults.retention.retention_hours)?
            .set_default(
                "retention.max_batch_size",
                defaults.retention.max_batch_size as u64,
            )?
            .set_default("tools.enabled", defaults.tools.enabled)?
            .set_default(
                "tools.execution_timeout_seconds",
                defaults.tools.execution_timeout_seconds,
            )?;

        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<()> {
        if self.device.device_id.is_empty() {
            return Err(anyhow::anyhow!("device.device_id 不能为空"));
        }
        if !matches!(self.device.device_kind.as_str(), "desktop" | "mobile") {
            return Err(anyhow::anyhow!(
                "不支持的设备类型: {}",
                self.device.device_kind
            ));
        }
        if self.client.max_poll_attempts == 0 {
            return Err(anyhow::anyhow!("client.max_poll_attempts 必须大于0"));
        }
        if self.worker.max_concurrent_requests == 0 {
            return Err(anyhow::anyhow!("worker.max_concurrent_requests 必须大于0"));
        }
        if self.presence.staleness_window_seconds <= 0 {
            return Err(anyhow::anyhow!("presence.staleness_window_seconds 必须大于0"));
        }
        if self.store.inline_body_limit == 0 {
            return Err(anyhow::anyhow!("store.inline_body_limit 必须大于0"));
        }
        Ok(())
    }
}
