use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{ClientConfig, RelayError, Result};
use relay_domain::entities::{RelayRequest, RelayResponse, RequestStatus};
use relay_domain::events::{RecordEvent, RelayEvent};
use relay_domain::ports::{PushChannel, RequestStore, ResponseStore};
use relay_domain::stats::RelaySideStats;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 请求提交器构建器
pub struct RequestSubmitterBuilder {
    requests: Arc<dyn RequestStore>,
    responses: Arc<dyn ResponseStore>,
    push: Arc<dyn PushChannel>,
    config: ClientConfig,
}

impl RequestSubmitterBuilder {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        responses: Arc<dyn ResponseStore>,
        push: Arc<dyn PushChannel>,
    ) -> Self {
        Self {
            requests,
            responses,
            push,
            config: ClientConfig {
                poll_interval_ms: 5000,
                max_poll_attempts: 60,
                discovery_interval_seconds: 10,
                connected_discovery_interval_seconds: 30,
            },
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> RequestSubmitter {
        let (event_tx, _) = broadcast::channel(64);
        RequestSubmitter {
            requests: self.requests,
            responses: self.responses,
            push: self.push,
            config: self.config,
            target_device: Arc::new(RwLock::new(None)),
            pending_waits: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelaySideStats::default())),
            event_tx,
        }
    }
}

/// 请求提交器（移动端角色）
///
/// 把请求写入共享记录存储，通过推送通知与有界轮询的竞速
/// 等待匹配的响应。推送纯属加速，轮询兜底保证正确性——
/// 推送完全失效时一切流程依然收敛。
pub struct RequestSubmitter {
    requests: Arc<dyn RequestStore>,
    responses: Arc<dyn ResponseStore>,
    push: Arc<dyn PushChannel>,
    config: ClientConfig,
    /// 当前连接的目标设备
    target_device: Arc<RwLock<Option<String>>>,
    /// 未决等待，按请求ID索引；推送分发器与轮询竞争填充
    pending_waits: Arc<Mutex<HashMap<String, oneshot::Sender<RelayResponse>>>>,
    /// 提交侧统计
    stats: Arc<RwLock<RelaySideStats>>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RequestSubmitter {
    pub fn builder(
        requests: Arc<dyn RequestStore>,
        responses: Arc<dyn ResponseStore>,
        push: Arc<dyn PushChannel>,
    ) -> RequestSubmitterBuilder {
        RequestSubmitterBuilder::new(requests, responses, push)
    }

    /// 启动推送分发循环
    ///
    /// 监听ResponseSaved事件并填充对应的未决等待。事件可能
    /// 重复或指向未知请求，两种情况都直接忽略。
    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut push_rx = self.push.subscribe();
        let pending_waits = Arc::clone(&self.pending_waits);
        let responses = Arc::clone(&self.responses);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = push_rx.recv() => {
                        match event {
                            Ok(RecordEvent::ResponseSaved { request_id, .. }) => {
                                let has_wait =
                                    pending_waits.lock().await.contains_key(&request_id);
                                if !has_wait {
                                    // 已取消或已由轮询解决的请求，忽略迟到推送
                                    debug!(request_id = %request_id, "推送指向未知等待，忽略");
                                    continue;
                                }
                                match responses.find_by_request_id(&request_id).await {
                                    Ok(Some(response)) => {
                                        if let Some(tx) =
                                            pending_waits.lock().await.remove(&request_id)
                                        {
                                            let _ = tx.send(response);
                                        }
                                    }
                                    Ok(None) => {
                                        debug!(request_id = %request_id, "推送先于响应可见，等待轮询");
                                    }
                                    Err(e) => {
                                        warn!("推送触发的响应查询失败: {e}");
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("推送事件滞后，丢失 {n} 条");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("推送分发循环收到关闭信号");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// 连接到目标设备
    pub async fn connect_to(&self, device_id: impl Into<String>) {
        let device_id = device_id.into();
        info!(device_id = %device_id, "已连接目标设备");
        *self.target_device.write().await = Some(device_id);
    }

    /// 断开连接
    pub async fn disconnect(&self) {
        *self.target_device.write().await = None;
    }

    pub async fn connected_device(&self) -> Option<String> {
        self.target_device.read().await.clone()
    }

    /// 发送请求并等待响应
    ///
    /// `timeout`覆盖默认的轮询预算；None使用配置值。
    #[allow(clippy::too_many_arguments)]
    pub async fn send_request(
        &self,
        service_id: &str,
        service_name: &str,
        endpoint: &str,
        method: &str,
        headers: HashMap<String, String>,
        body: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<RelayResponse> {
        let target = self
            .target_device
            .read()
            .await
            .clone()
            .ok_or(RelayError::NotConnected)?;

        let request = RelayRequest::new(
            service_id,
            service_name,
            endpoint,
            method,
            headers,
            body,
            target,
        );
        let request_id = request.id.clone();
        let started = std::time::Instant::now();

        // 持久化请求，失败重试恰好一次
        if let Err(first) = self.requests.save(&request).await {
            warn!(request_id = %request_id, "请求写入失败，重试一次: {first}");
            self.requests
                .save(&request)
                .await
                .map_err(|e| RelayError::SendFailed(e.to_string()))?;
        }
        // 推送通知尽力而为
        if let Err(e) = self
            .push
            .publish(RecordEvent::RequestSaved {
                target_device_id: request.target_device_id.clone(),
                request_id: request_id.clone(),
            })
            .await
        {
            debug!("请求推送通知失败: {e}");
        }

        // 注册未决等待
        let (wait_tx, wait_rx) = oneshot::channel();
        self.pending_waits
            .lock()
            .await
            .insert(request_id.clone(), wait_tx);

        info!(
            request_id = %request_id,
            service = service_name,
            endpoint = endpoint,
            "请求已提交，开始等待响应"
        );

        let result = self.wait_for_response(&request_id, wait_rx, timeout).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                self.stats
                    .write()
                    .await
                    .record(response.is_success(), elapsed_ms);
                let _ = self.event_tx.send(RelayEvent::RequestCompleted {
                    request_id: request_id.clone(),
                    success: response.is_success(),
                });
            }
            Err(e) => {
                self.stats.write().await.record(false, elapsed_ms);
                let _ = self.event_tx.send(RelayEvent::RequestCompleted {
                    request_id: request_id.clone(),
                    success: false,
                });
                warn!(request_id = %request_id, "请求失败: {e}");
            }
        }
        result
    }

    /// 推送与轮询竞速等待
    async fn wait_for_response(
        &self,
        request_id: &str,
        mut wait_rx: oneshot::Receiver<RelayResponse>,
        timeout: Option<Duration>,
    ) -> Result<RelayResponse> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_attempts = match timeout {
            Some(timeout) => {
                (timeout.as_millis() / poll_interval.as_millis().max(1)).max(1) as u32
            }
            None => self.config.max_poll_attempts,
        };

        for attempt in 0..max_attempts {
            tokio::select! {
                // 推送分发器填充了等待
                resolved = &mut wait_rx => {
                    return match resolved {
                        Ok(response) => {
                            debug!(request_id = %request_id, attempt, "推送路径命中");
                            Ok(response)
                        }
                        // 发送端被取消丢弃
                        Err(_) => {
                            debug!(request_id = %request_id, "等待已被取消");
                            Err(RelayError::Timeout)
                        }
                    };
                }
                // 轮询兜底
                _ = sleep(poll_interval) => {
                    match self.responses.find_by_request_id(request_id).await {
                        Ok(Some(response)) => {
                            debug!(request_id = %request_id, attempt, "轮询路径命中");
                            self.pending_waits.lock().await.remove(request_id);
                            return Ok(response);
                        }
                        Ok(None) => {}
                        // 存储瞬时故障按无结果处理，下一轮重查
                        Err(e) => warn!(request_id = %request_id, "轮询查询失败: {e}"),
                    }
                }
            }
        }

        // 轮询预算耗尽
        self.pending_waits.lock().await.remove(request_id);
        Err(RelayError::Timeout)
    }

    /// 取消本地等待，尽力而为地把存储中的请求标记为已取消
    ///
    /// 处理方可能已经在处理该请求并随后写回响应，迟到的响应
    /// 会被推送分发器当作未知等待直接忽略。
    pub async fn cancel_request(&self, request_id: &str) {
        let removed = self.pending_waits.lock().await.remove(request_id);
        if removed.is_some() {
            info!(request_id = %request_id, "本地等待已取消");
        }
        if let Err(e) = self
            .requests
            .update_status(request_id, RequestStatus::Cancelled)
            .await
        {
            debug!(request_id = %request_id, "取消状态写回失败: {e}");
        }
    }

    /// 当前未决等待数量
    pub async fn wait_count(&self) -> usize {
        self.pending_waits.lock().await.len()
    }

    /// 提交侧统计快照
    pub async fn stats(&self) -> RelaySideStats {
        self.stats.read().await.clone()
    }

    /// 订阅请求完成事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
impl RequestSubmitter {
    pub(crate) async fn has_wait(&self, request_id: &str) -> bool {
        self.pending_waits.lock().await.contains_key(request_id)
    }
}
