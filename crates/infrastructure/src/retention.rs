use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_core::{Result, RetentionConfig};
use relay_domain::ports::{RequestStore, ResponseStore};
use tokio::time::interval;
use tracing::{error, info};

/// 过期记录清理服务
///
/// 启动时执行一次，之后按固定间隔运行。删除超过保留窗口的
/// 请求与响应记录；仍处于PENDING状态的请求不论多旧都保留，
/// 未被认领的工作永远不能被清理掉。
pub struct RetentionSweeper {
    requests: Arc<dyn RequestStore>,
    responses: Arc<dyn ResponseStore>,
    config: RetentionConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    sweep_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RetentionSweeper {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        responses: Arc<dyn ResponseStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            requests,
            responses,
            config,
            shutdown_tx: None,
            sweep_handle: None,
        }
    }

    /// 启动清理循环
    pub async fn start(&mut self) -> Result<()> {
        if !self.config.enabled {
            info!("记录清理服务已禁用");
            return Ok(());
        }

        info!("启动记录清理服务: {:?}", self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let requests = Arc::clone(&self.requests);
        let responses = Arc::clone(&self.responses);
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            // 启动时先清理一次
            if let Err(e) = Self::perform_sweep(&requests, &responses, &config).await {
                error!("启动清理失败: {e}");
            }

            let mut sweep_interval =
                interval(Duration::from_secs(config.sweep_interval_seconds));
            sweep_interval.reset();

            loop {
                tokio::select! {
                    _ = sweep_interval.tick() => {
                        if let Err(e) = Self::perform_sweep(&requests, &responses, &config).await {
                            error!("定时清理失败: {e}");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("记录清理服务收到关闭信号");
                        break;
                    }
                }
            }
        });

        self.sweep_handle = Some(handle);
        Ok(())
    }

    /// 停止清理循环
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.sweep_handle.take() {
            let _ = handle.await;
        }
        info!("记录清理服务已停止");
        Ok(())
    }

    /// 手动执行一次清理
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        Self::perform_sweep(&self.requests, &self.responses, &self.config).await
    }

    async fn perform_sweep(
        requests: &Arc<dyn RequestStore>,
        responses: &Arc<dyn ResponseStore>,
        config: &RetentionConfig,
    ) -> Result<SweepStats> {
        let start = std::time::Instant::now();
        let cutoff = Utc::now() - chrono::Duration::hours(config.retention_hours);

        let requests_deleted = requests
            .delete_finished_before(cutoff, config.max_batch_size)
            .await?;
        let responses_deleted = responses
            .delete_created_before(cutoff, config.max_batch_size)
            .await?;

        let stats = SweepStats {
            requests_deleted,
            responses_deleted,
            duration: start.elapsed(),
        };

        if stats.has_deletions() {
            info!(
                "清理完成: 请求 {} 条, 响应 {} 条, 耗时 {:?}",
                stats.requests_deleted, stats.responses_deleted, stats.duration
            );
        }
        Ok(stats)
    }
}

/// 单次清理统计
#[derive(Debug, Default)]
pub struct SweepStats {
    pub requests_deleted: usize,
    pub responses_deleted: usize,
    pub duration: Duration,
}

impl SweepStats {
    pub fn has_deletions(&self) -> bool {
        self.requests_deleted + self.responses_deleted > 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use relay_domain::entities::{RelayRequest, RelayResponse, RequestStatus};

    use super::*;
    use crate::store::memory::InMemoryRecordStore;

    fn sweeper_with(store: &InMemoryRecordStore, retention_hours: i64) -> RetentionSweeper {
        RetentionSweeper::new(
            Arc::new(store.requests()),
            Arc::new(store.responses()),
            RetentionConfig {
                enabled: true,
                sweep_interval_seconds: 3600,
                retention_hours,
                max_batch_size: 100,
            },
        )
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_finished_preserves_pending() {
        let store = InMemoryRecordStore::new();
        let requests = store.requests();

        let mut old_completed = RelayRequest::new(
            "svc", "s", "/x", "GET", HashMap::new(), None, "dev-1",
        );
        old_completed.status = RequestStatus::Completed;
        old_completed.created_at = Utc::now() - chrono::Duration::hours(30);
        let mut old_pending = RelayRequest::new(
            "svc", "s", "/x", "GET", HashMap::new(), None, "dev-1",
        );
        old_pending.created_at = Utc::now() - chrono::Duration::hours(30);
        let fresh = RelayRequest::new("svc", "s", "/x", "GET", HashMap::new(), None, "dev-1");

        requests.save(&old_completed).await.unwrap();
        requests.save(&old_pending).await.unwrap();
        requests.save(&fresh).await.unwrap();

        let sweeper = sweeper_with(&store, 24);
        let stats = sweeper.sweep_once().await.unwrap();

        assert_eq!(stats.requests_deleted, 1);
        assert!(requests.get_by_id(&old_completed.id).await.unwrap().is_none());
        // 同样老的PENDING请求必须保留
        assert!(requests.get_by_id(&old_pending.id).await.unwrap().is_some());
        assert!(requests.get_by_id(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_responses() {
        let store = InMemoryRecordStore::new();
        let responses = store.responses();

        let mut old = RelayResponse::new("req-1", 200, HashMap::new(), None, 10);
        old.created_at = Utc::now() - chrono::Duration::hours(30);
        let fresh = RelayResponse::new("req-2", 200, HashMap::new(), None, 10);
        responses.save(&old).await.unwrap();
        responses.save(&fresh).await.unwrap();

        let sweeper = sweeper_with(&store, 24);
        let stats = sweeper.sweep_once().await.unwrap();

        assert_eq!(stats.responses_deleted, 1);
        assert!(responses.find_by_request_id("req-1").await.unwrap().is_none());
        assert!(responses.find_by_request_id("req-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_runs_initial_sweep() {
        let store = InMemoryRecordStore::new();
        let requests = store.requests();

        let mut old_failed = RelayRequest::new(
            "svc", "s", "/x", "GET", HashMap::new(), None, "dev-1",
        );
        old_failed.status = RequestStatus::Failed;
        old_failed.created_at = Utc::now() - chrono::Duration::hours(30);
        requests.save(&old_failed).await.unwrap();

        let mut sweeper = sweeper_with(&store, 24);
        sweeper.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(requests.get_by_id(&old_failed.id).await.unwrap().is_none());
        sweeper.stop().await.unwrap();
    }
}
