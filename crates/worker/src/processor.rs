use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use relay_core::{RelayError, Result, WorkerConfig};
use relay_domain::entities::{RelayRequest, RelayResponse, RequestStatus, ServiceDescriptor};
use relay_domain::events::{RecordEvent, RelayEvent};
use relay_domain::ports::{PushChannel, RequestStore, ResponseStore, ServiceRegistry};
use relay_domain::stats::RelaySideStats;
use relay_tools::ToolOrchestrator;
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// 请求处理器构建器
pub struct RequestProcessorBuilder {
    device_id: String,
    requests: Arc<dyn RequestStore>,
    responses: Arc<dyn ResponseStore>,
    push: Arc<dyn PushChannel>,
    registry: Arc<dyn ServiceRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    config: WorkerConfig,
}

impl RequestProcessorBuilder {
    pub fn new(
        device_id: String,
        requests: Arc<dyn RequestStore>,
        responses: Arc<dyn ResponseStore>,
        push: Arc<dyn PushChannel>,
        registry: Arc<dyn ServiceRegistry>,
        orchestrator: Arc<ToolOrchestrator>,
    ) -> Self {
        Self {
            device_id,
            requests,
            responses,
            push,
            registry,
            orchestrator,
            config: WorkerConfig {
                enabled: true,
                poll_interval_seconds: 5,
                max_concurrent_requests: 5,
                request_timeout_seconds: 300,
                services: Vec::new(),
            },
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<RequestProcessor> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(RequestProcessor {
            device_id: self.device_id,
            requests: self.requests,
            responses: self.responses,
            push: self.push,
            registry: self.registry,
            orchestrator: self.orchestrator,
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent_requests)),
            config: self.config,
            active_request_ids: Arc::new(RwLock::new(HashSet::new())),
            stats: Arc::new(RwLock::new(RelaySideStats::default())),
            event_tx,
            http_client: reqwest::Client::new(),
        })
    }
}

/// 请求处理器（桌面端角色）
///
/// 通过订阅与固定间隔轮询双路发现本设备的待处理请求——
/// 推送投递不可靠，轮询是正确性兜底。`active_request_ids`
/// 保证同一请求ID同时最多一次处理；条目在处理结束时无条件
/// 移除，绝不跨越一次处理尝试残留。
pub struct RequestProcessor {
    device_id: String,
    requests: Arc<dyn RequestStore>,
    responses: Arc<dyn ResponseStore>,
    push: Arc<dyn PushChannel>,
    registry: Arc<dyn ServiceRegistry>,
    orchestrator: Arc<ToolOrchestrator>,
    config: WorkerConfig,
    /// 正在处理的请求ID集合（进程内去重，非分布式锁：
    /// 每个请求只有唯一目标设备，本地互斥已足够）
    active_request_ids: Arc<RwLock<HashSet<String>>>,
    /// 并发处理上限
    semaphore: Arc<Semaphore>,
    /// 处理侧统计
    stats: Arc<RwLock<RelaySideStats>>,
    event_tx: broadcast::Sender<RelayEvent>,
    http_client: reqwest::Client,
}

impl RequestProcessor {
    pub fn builder(
        device_id: String,
        requests: Arc<dyn RequestStore>,
        responses: Arc<dyn ResponseStore>,
        push: Arc<dyn PushChannel>,
        registry: Arc<dyn ServiceRegistry>,
        orchestrator: Arc<ToolOrchestrator>,
    ) -> RequestProcessorBuilder {
        RequestProcessorBuilder::new(device_id, requests, responses, push, registry, orchestrator)
    }

    /// 启动处理循环：推送订阅 + 轮询兜底
    pub async fn start(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        // 启动时清理无法匹配本地服务的陈旧待处理请求
        if let Err(e) = self.cleanup_stale_pending().await {
            warn!("陈旧请求清理失败: {e}");
        }

        let processor = Arc::clone(&self);
        let mut push_rx = self.push.subscribe();
        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_seconds));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // 推送快路径
                    event = push_rx.recv() => {
                        match event {
                            Ok(RecordEvent::RequestSaved { target_device_id, request_id })
                                if target_device_id == processor.device_id =>
                            {
                                debug!(request_id = %request_id, "推送发现新请求");
                                let processor = Arc::clone(&processor);
                                tokio::spawn(async move {
                                    match processor.requests.get_by_id(&request_id).await {
                                        Ok(Some(request))
                                            if request.status == RequestStatus::Pending =>
                                        {
                                            processor.process_request(request).await;
                                        }
                                        Ok(_) => {}
                                        Err(e) => warn!("推送触发的请求查询失败: {e}"),
                                    }
                                });
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("推送事件滞后，丢失 {n} 条，轮询兜底");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                warn!("推送通道关闭，仅剩轮询路径");
                                push_rx = processor.push.subscribe();
                            }
                        }
                    }
                    // 轮询兜底路径
                    _ = poll_interval.tick() => {
                        if let Err(e) = Self::poll_pending(&processor).await {
                            error!("轮询待处理请求失败: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("请求处理循环收到关闭信号");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// 轮询并分发全部待处理请求
    async fn poll_pending(processor: &Arc<Self>) -> Result<()> {
        let pending = processor
            .requests
            .list_pending_for_device(&processor.device_id)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "轮询发现待处理请求");
        for request in pending {
            let processor = Arc::clone(processor);
            tokio::spawn(async move {
                processor.process_request(request).await;
            });
        }
        Ok(())
    }

    /// 启动清理：删除服务ID已无法匹配任何本地服务的待处理请求
    ///
    /// 服务ID会随重启漂移；留着这些请求只会让客户端空等到超时。
    pub async fn cleanup_stale_pending(&self) -> Result<()> {
        let pending = self.requests.list_pending_for_device(&self.device_id).await?;
        let mut removed = 0usize;
        for request in pending {
            if self.registry.get(&request.service_id).await.is_none() {
                info!(
                    request_id = %request.id,
                    service_id = %request.service_id,
                    "清理无法匹配本地服务的陈旧请求"
                );
                self.requests.delete(&request.id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(count = removed, "陈旧待处理请求清理完成");
        }
        Ok(())
    }

    /// 处理单个请求
    ///
    /// 非本设备请求与处理中的重复请求都静默丢弃。无论成功
    /// 失败，处理结束时`active_request_ids`条目必被移除。
    pub async fn process_request(&self, request: RelayRequest) {
        if request.target_device_id != self.device_id {
            debug!(
                request_id = %request.id,
                target = %request.target_device_id,
                "忽略非本设备请求"
            );
            return;
        }

        // 并发上限
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        // 认领：推送与轮询可能同时看到同一请求，以此去重
        {
            let mut active = self.active_request_ids.write().await;
            if !active.insert(request.id.clone()) {
                debug!(request_id = %request.id, "请求已在处理中，丢弃重复认领");
                return;
            }
        }

        let started = std::time::Instant::now();
        let outcome = self.handle_claimed(&request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // 成功、失败、提前返回都必须释放认领
        self.active_request_ids.write().await.remove(&request.id);

        let success = outcome.is_ok();
        if let Err(e) = outcome {
            error!(request_id = %request.id, "请求处理失败: {e}");
            self.finalize_error(&request, e.to_string(), elapsed_ms).await;
        }

        self.stats.write().await.record(success, elapsed_ms);
        let _ = self.event_tx.send(RelayEvent::RequestCompleted {
            request_id: request.id.clone(),
            success,
        });
    }

    /// 已认领请求的实际处理流程
    async fn handle_claimed(&self, request: &RelayRequest) -> Result<()> {
        info!(
            request_id = %request.id,
            service = %request.service_name,
            endpoint = %request.endpoint,
            "开始处理请求"
        );

        // 状态转移尽力而为，失败不阻断处理
        if let Err(e) = self
            .requests
            .update_status(&request.id, RequestStatus::Processing)
            .await
        {
            warn!(request_id = %request.id, "状态转移PROCESSING写回失败: {e}");
        }

        // 解析目标服务
        let service = self
            .registry
            .get(&request.service_id)
            .await
            .ok_or_else(|| RelayError::ServiceNotFound {
                id: request.service_id.clone(),
            })?;

        let started = std::time::Instant::now();
        let dispatched = self.dispatch_http(request, &service).await?;

        // 工具编排钩子：无工具指令或任何失败都返回原始响应体
        let final_body = self
            .orchestrator
            .handle_response(&dispatched.body, request, &service)
            .await;

        let response = RelayResponse::new(
            &request.id,
            dispatched.status_code,
            dispatched.headers,
            Some(final_body),
            started.elapsed().as_millis() as u64,
        );
        let response_id = response.id.clone();
        self.responses.save(&response).await?;
        if let Err(e) = self
            .push
            .publish(RecordEvent::ResponseSaved {
                request_id: request.id.clone(),
                response_id,
            })
            .await
        {
            debug!("响应推送通知失败: {e}");
        }

        if let Err(e) = self
            .requests
            .update_status(&request.id, RequestStatus::Completed)
            .await
        {
            warn!(request_id = %request.id, "状态转移COMPLETED写回失败: {e}");
        }

        info!(
            request_id = %request.id,
            status = dispatched.status_code,
            duration_ms = started.elapsed().as_millis() as u64,
            "请求处理完成"
        );
        Ok(())
    }

    /// 把本地HTTP服务的响应搬运回来
    async fn dispatch_http(
        &self,
        request: &RelayRequest,
        service: &ServiceDescriptor,
    ) -> Result<DispatchedResponse> {
        let url = format!("{}{}", service.effective_base_url(), request.endpoint);

        let mut builder = match request.method.to_uppercase().as_str() {
            "GET" => self.http_client.get(&url),
            "POST" => self.http_client.post(&url),
            "PUT" => self.http_client.put(&url),
            "DELETE" => self.http_client.delete(&url),
            "PATCH" => self.http_client.patch(&url),
            "HEAD" => self.http_client.head(&url),
            other => {
                return Err(RelayError::ServiceUnreachable(format!(
                    "不支持的HTTP方法: {other}"
                )));
            }
        };

        // AI推理可能很慢，转发超时放得很宽
        builder = builder.timeout(Duration::from_secs(self.config.request_timeout_seconds));

        for (key, value) in &request.headers {
            if key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(key, value);
        }

        // 工具注入按服务逐个判定
        let mut body = request.body.clone();
        if self.orchestrator.should_inject_tools(service) {
            if let Some(bytes) = body.take() {
                body = Some(self.orchestrator.inject_tools(&bytes));
            }
        }
        if let Some(bytes) = body {
            builder = builder.body(bytes);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::ServiceUnreachable(format!("转发本地服务失败: {e}")))?;

        let status_code = response.status().as_u16();
        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::ServiceUnreachable(format!("读取本地服务响应失败: {e}")))?
            .to_vec();

        Ok(DispatchedResponse {
            status_code,
            headers,
            body,
        })
    }

    /// 失败路径也必须写回一条响应，客户端永远不该只收到沉默
    async fn finalize_error(&self, request: &RelayRequest, message: String, elapsed_ms: u64) {
        let response = RelayResponse::error_response(&request.id, message, elapsed_ms);
        let response_id = response.id.clone();
        if let Err(e) = self.responses.save(&response).await {
            error!(request_id = %request.id, "错误响应写回失败: {e}");
        } else if let Err(e) = self
            .push
            .publish(RecordEvent::ResponseSaved {
                request_id: request.id.clone(),
                response_id,
            })
            .await
        {
            debug!("错误响应推送通知失败: {e}");
        }
        if let Err(e) = self
            .requests
            .update_status(&request.id, RequestStatus::Failed)
            .await
        {
            warn!(request_id = %request.id, "状态转移FAILED写回失败: {e}");
        }
    }

    /// 当前正在处理的请求数量
    pub async fn active_count(&self) -> usize {
        self.active_request_ids.read().await.len()
    }

    /// 处理侧统计快照
    pub async fn stats(&self) -> RelaySideStats {
        self.stats.read().await.clone()
    }

    /// 订阅请求完成事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }
}

struct DispatchedResponse {
    status_code: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}
