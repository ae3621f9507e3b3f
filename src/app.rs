use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_client::{choose_device, ConnectDecision, RequestSubmitter};
use relay_core::{AppConfig, ServiceEntryConfig};
use relay_domain::entities::{ApiFormat, DeviceKind, ServiceDescriptor, ServiceKind};
use relay_domain::handshake::HandshakePayload;
use relay_domain::ports::{AnnouncementStore, PushChannel, RequestStore, ResponseStore};
use relay_infrastructure::{
    InProcessPushChannel, PresenceService, RetentionSweeper, SqliteRecordStore,
    StaticServiceRegistry,
};
use relay_tools::{FsToolBackend, ToolOrchestrator, ToolRegistry, ToolServerBackend};
use relay_worker::RequestProcessor;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 桌面端：处理请求、公告在线状态、清理过期记录
    Worker,
    /// 移动端：发现设备并提交请求
    Client,
    /// 单进程同时运行两侧（嵌入式/调试）
    All,
}

/// 主应用程序
///
/// 所有服务在启动时显式构造并按引用传递，没有全局单例。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    submitter: Arc<RequestSubmitter>,
    processor: Arc<RequestProcessor>,
    presence: PresenceService,
    sweeper: Mutex<RetentionSweeper>,
    handshake_seed: Option<HandshakePayload>,
    // 组件统一从这里领取关闭信号
    shutdown_tx: broadcast::Sender<()>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(
        mut config: AppConfig,
        mode: AppMode,
        handshake: Option<&str>,
    ) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        // 未配置设备名时回落为主机名
        if config.device.device_name.is_empty() {
            config.device.device_name = hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string();
        }

        // 共享记录存储
        let store = SqliteRecordStore::connect(&config.store)
            .await
            .context("连接记录存储失败")?;
        let requests: Arc<dyn RequestStore> = Arc::new(store.requests());
        let responses: Arc<dyn ResponseStore> = Arc::new(store.responses());
        let announcements: Arc<dyn AnnouncementStore> = Arc::new(store.announcements());

        // 推送通道尽力而为，轮询兜底正确性
        let push: Arc<dyn PushChannel> = Arc::new(InProcessPushChannel::new());

        // 本地服务注册表（静态种子，动态探测由外部协作方负责）
        let services: Vec<ServiceDescriptor> = config
            .worker
            .services
            .iter()
            .map(service_from_config)
            .collect();
        let registry = Arc::new(StaticServiceRegistry::new(services));

        // 工具后端注册表
        let mut tool_registry = ToolRegistry::new();
        if config.tools.enabled {
            if let Some(fs_root) = &config.tools.fs_root {
                tool_registry.register(Arc::new(FsToolBackend::new(fs_root)));
            }
            for server in &config.tools.servers {
                let backend = Arc::new(ToolServerBackend::new(
                    server.clone(),
                    Duration::from_secs(config.tools.execution_timeout_seconds),
                ));
                if let Err(e) = backend.connect().await {
                    warn!(server = %server.name, "工具服务器预热失败，首次调用时重试: {e}");
                }
                tool_registry.register(backend);
            }
        }
        let orchestrator = Arc::new(ToolOrchestrator::new(
            Arc::new(tool_registry),
            Duration::from_secs(config.worker.request_timeout_seconds),
            Duration::from_secs(config.tools.execution_timeout_seconds),
        ));

        let device_kind = DeviceKind::from_str(&config.device.device_kind)
            .map_err(|e| anyhow::anyhow!("设备类型无效: {e}"))?;

        let processor = RequestProcessor::builder(
            config.device.device_id.clone(),
            Arc::clone(&requests),
            Arc::clone(&responses),
            Arc::clone(&push),
            registry.clone(),
            orchestrator,
        )
        .config(config.worker.clone())
        .build();

        let submitter = Arc::new(
            RequestSubmitter::builder(
                Arc::clone(&requests),
                Arc::clone(&responses),
                Arc::clone(&push),
            )
            .config(config.client.clone())
            .build(),
        );

        let presence = PresenceService::new(
            config.device.device_id.clone(),
            config.device.device_name.clone(),
            device_kind,
            announcements,
            registry,
            push,
            config.presence.clone(),
        );

        let sweeper = Mutex::new(RetentionSweeper::new(
            requests,
            responses,
            config.retention.clone(),
        ));

        let handshake_seed = match handshake {
            Some(text) => Some(
                HandshakePayload::parse(text)
                    .map_err(|e| anyhow::anyhow!("握手载荷无效: {e}"))?,
            ),
            None => None,
        };

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            mode,
            submitter,
            processor,
            presence,
            sweeper,
            handshake_seed,
            shutdown_tx,
        })
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Worker => self.start_worker_side().await?,
            AppMode::Client => self.start_client_side().await?,
            AppMode::All => {
                self.start_worker_side().await?;
                self.start_client_side().await?;
            }
        }

        // 等待外部关闭信号并转发给所有组件
        let _ = shutdown_rx.recv().await;
        info!("开始停止所有组件");
        let _ = self.shutdown_tx.send(());
        self.sweeper.lock().await.stop().await.ok();

        Ok(())
    }

    /// 启动桌面端组件：处理器 + 在线公告 + 过期清理
    async fn start_worker_side(&self) -> Result<()> {
        self.processor
            .clone()
            .start(self.shutdown_tx.subscribe())
            .await
            .map_err(|e| anyhow::anyhow!("启动请求处理器失败: {e}"))?;
        self.presence
            .start(self.shutdown_tx.subscribe())
            .await
            .map_err(|e| anyhow::anyhow!("启动在线公告失败: {e}"))?;
        self.sweeper
            .lock()
            .await
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("启动记录清理失败: {e}"))?;
        info!("桌面端组件已启动");
        Ok(())
    }

    /// 启动移动端组件：提交器 + 发现/自动连接循环
    async fn start_client_side(&self) -> Result<()> {
        self.submitter
            .start(self.shutdown_tx.subscribe())
            .await
            .map_err(|e| anyhow::anyhow!("启动请求提交器失败: {e}"))?;

        // 握手载荷播种初始目标设备，之后由发现循环接管
        if let Some(seed) = &self.handshake_seed {
            info!(device_id = %seed.device_id, "使用握手载荷播种目标设备");
            self.submitter.connect_to(seed.device_id.clone()).await;
        }

        let submitter = Arc::clone(&self.submitter);
        let presence = self.presence.clone();
        let config = self.config.client.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut previous = submitter.connected_device().await;
            loop {
                // 连接后发现继续运行，但节奏放慢
                let interval_seconds = if submitter.connected_device().await.is_some() {
                    config.connected_discovery_interval_seconds
                } else {
                    config.discovery_interval_seconds
                };

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_seconds)) => {
                        let candidates = match presence.discover(DeviceKind::Desktop).await {
                            Ok(candidates) => candidates,
                            Err(e) => {
                                error!("设备发现失败: {e}");
                                continue;
                            }
                        };
                        match choose_device(previous.as_deref(), &candidates) {
                            ConnectDecision::Reconnect(device_id)
                            | ConnectDecision::AutoConnect(device_id) => {
                                if submitter.connected_device().await.as_deref()
                                    != Some(device_id.as_str())
                                {
                                    submitter.connect_to(device_id.clone()).await;
                                }
                                previous = Some(device_id);
                            }
                            ConnectDecision::NeedsSelection(device_ids) => {
                                info!(candidates = ?device_ids, "多个候选设备，等待用户选择");
                            }
                            ConnectDecision::NoDevices => {}
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        info!("移动端组件已启动");
        Ok(())
    }
}

/// 配置条目转服务描述
fn service_from_config(entry: &ServiceEntryConfig) -> ServiceDescriptor {
    let kind = match entry.kind.as_str() {
        "language_model" => ServiceKind::LanguageModel,
        "image_generation" => ServiceKind::ImageGeneration,
        _ => ServiceKind::Generic,
    };
    let api_format = match entry.api_format.as_deref() {
        Some("chat_completions") => ApiFormat::ChatCompletions,
        _ => ApiFormat::Plain,
    };
    ServiceDescriptor {
        id: entry.id.clone(),
        name: entry.name.clone(),
        kind,
        port: entry.port,
        api_format,
        is_running: true,
        base_url: entry.base_url.clone(),
        workflows: entry.workflows.clone(),
    }
}
