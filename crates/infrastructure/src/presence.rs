use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{PresenceConfig, Result};
use relay_domain::entities::{DeviceAnnouncement, DeviceKind};
use relay_domain::events::RecordEvent;
use relay_domain::ports::{AnnouncementStore, PushChannel, ServiceRegistry};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 设备在线公告服务
///
/// 启动时立即公告一次，之后按固定间隔刷新；本地服务列表
/// 变化时也会立即触发一次公告。公告按设备ID原地覆盖写入，
/// 过期记录由发现侧的新鲜度窗口过滤，不做即时删除。
#[derive(Clone)]
pub struct PresenceService {
    device_id: String,
    device_name: String,
    device_kind: DeviceKind,
    announcements: Arc<dyn AnnouncementStore>,
    registry: Arc<dyn ServiceRegistry>,
    push: Arc<dyn PushChannel>,
    config: PresenceConfig,
}

impl PresenceService {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_kind: DeviceKind,
        announcements: Arc<dyn AnnouncementStore>,
        registry: Arc<dyn ServiceRegistry>,
        push: Arc<dyn PushChannel>,
        config: PresenceConfig,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_kind,
            announcements,
            registry,
            push,
            config,
        }
    }

    /// 启动公告循环
    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        // 启动时立即公告一次
        if let Err(e) = self.announce().await {
            warn!("启动公告失败: {e}");
        }

        let service = self.clone();
        let mut change_rx = self.registry.subscribe_changes();
        let mut announce_interval =
            interval(Duration::from_secs(self.config.announce_interval_seconds));
        announce_interval.reset();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = announce_interval.tick() => {
                        if let Err(e) = service.announce().await {
                            error!("定时公告失败: {e}");
                        }
                    }
                    changed = change_rx.recv() => {
                        match changed {
                            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                                debug!("服务列表变化，立即刷新公告");
                                if let Err(e) = service.announce().await {
                                    error!("服务变更公告失败: {e}");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                // 注册表已销毁，仅保留定时公告
                                change_rx = service.registry.subscribe_changes();
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("公告循环收到关闭信号");
                        if let Err(e) = service.mark_inactive().await {
                            warn!("下线标记失败: {e}");
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// 发布一次公告（读取-修改-写回）
    pub async fn announce(&self) -> Result<()> {
        let services = self.registry.running_services().await;
        let mut announcement = match self.announcements.get(&self.device_id).await? {
            Some(existing) => existing,
            None => DeviceAnnouncement {
                device_id: self.device_id.clone(),
                device_name: self.device_name.clone(),
                device_kind: self.device_kind,
                services: Vec::new(),
                last_seen_at: Utc::now(),
                is_active: true,
            },
        };
        announcement.device_name = self.device_name.clone();
        announcement.device_kind = self.device_kind;
        announcement.services = services;
        announcement.last_seen_at = Utc::now();
        announcement.is_active = true;

        self.announcements.upsert(&announcement).await?;
        self.push
            .publish(RecordEvent::AnnouncementSaved {
                device_id: self.device_id.clone(),
            })
            .await?;
        debug!(
            device_id = %self.device_id,
            services = announcement.services.len(),
            "公告已刷新"
        );
        Ok(())
    }

    /// 发现指定类型的在线设备，按最近心跳降序
    pub async fn discover(&self, kind: DeviceKind) -> Result<Vec<DeviceAnnouncement>> {
        let now = Utc::now();
        let window = self.config.staleness_window_seconds;
        let mut result: Vec<DeviceAnnouncement> = self
            .announcements
            .list_by_kind(kind)
            .await?
            .into_iter()
            .filter(|ann| ann.is_active && ann.is_fresh(window, now))
            .collect();
        result.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(result)
    }

    /// 优雅下线：置is_active=false并刷新时间戳，不删除记录
    pub async fn mark_inactive(&self) -> Result<()> {
        if let Some(mut announcement) = self.announcements.get(&self.device_id).await? {
            announcement.is_active = false;
            announcement.last_seen_at = Utc::now();
            self.announcements.upsert(&announcement).await?;
            info!(device_id = %self.device_id, "设备已标记下线");
        }
        Ok(())
    }
}
