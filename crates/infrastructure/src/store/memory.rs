//! 内存记录存储
//!
//! 无需真实数据库的进程内实现，用于单元测试与嵌入式单机部署。
//! 与SQLite实现保持相同的语义：按ID覆盖写、首条响应为准、
//! 超限二进制体走blob引用路径。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{RelayError, Result};
use relay_domain::entities::{
    DeviceAnnouncement, DeviceKind, RelayRequest, RelayResponse, RequestStatus,
};
use relay_domain::ports::{AnnouncementStore, RequestStore, ResponseStore};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    requests: Mutex<HashMap<String, StoredRequest>>,
    responses: Mutex<HashMap<String, StoredResponse>>,
    announcements: Mutex<HashMap<String, DeviceAnnouncement>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

struct StoredRequest {
    record: RelayRequest,
    body_ref: Option<String>,
}

struct StoredResponse {
    record: RelayResponse,
    body_ref: Option<String>,
}

/// 内存记录存储
#[derive(Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<Inner>,
    inline_body_limit: usize,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_inline_limit(900 * 1024)
    }

    pub fn with_inline_limit(inline_body_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            inline_body_limit,
        }
    }

    pub fn requests(&self) -> InMemoryRequestStore {
        InMemoryRequestStore {
            store: self.clone(),
        }
    }

    pub fn responses(&self) -> InMemoryResponseStore {
        InMemoryResponseStore {
            store: self.clone(),
        }
    }

    pub fn announcements(&self) -> InMemoryAnnouncementStore {
        InMemoryAnnouncementStore {
            store: self.clone(),
        }
    }

    /// 当前blob数量（测试断言用）
    pub fn blob_count(&self) -> usize {
        self.inner.blobs.lock().unwrap().len()
    }

    /// 当前请求数量（测试断言用）
    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }

    /// 当前响应数量（测试断言用）
    pub fn response_count(&self) -> usize {
        self.inner.responses.lock().unwrap().len()
    }

    fn split_body(&self, body: &Option<Vec<u8>>) -> (Option<Vec<u8>>, Option<String>) {
        match body {
            Some(bytes) if bytes.len() > self.inline_body_limit => {
                let handle = Uuid::new_v4().to_string();
                self.inner
                    .blobs
                    .lock()
                    .unwrap()
                    .insert(handle.clone(), bytes.clone());
                (None, Some(handle))
            }
            _ => (body.clone(), None),
        }
    }

    fn resolve_body(
        &self,
        inline: Option<Vec<u8>>,
        body_ref: &Option<String>,
    ) -> Option<Vec<u8>> {
        match body_ref {
            Some(handle) => self.inner.blobs.lock().unwrap().get(handle).cloned(),
            None => inline,
        }
    }

    fn drop_blob(&self, body_ref: &Option<String>) {
        if let Some(handle) = body_ref {
            self.inner.blobs.lock().unwrap().remove(handle);
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 内存请求仓储
#[derive(Clone)]
pub struct InMemoryRequestStore {
    store: InMemoryRecordStore,
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn save(&self, request: &RelayRequest) -> Result<()> {
        let (inline, body_ref) = self.store.split_body(&request.body);
        let mut record = request.clone();
        record.body = inline;
        let mut requests = self.store.inner.requests.lock().unwrap();
        if let Some(previous) = requests.remove(&request.id) {
            self.store.drop_blob(&previous.body_ref);
        }
        requests.insert(request.id.clone(), StoredRequest { record, body_ref });
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<RelayRequest>> {
        let requests = self.store.inner.requests.lock().unwrap();
        Ok(requests.get(id).map(|stored| {
            let mut record = stored.record.clone();
            record.body = self.store.resolve_body(record.body.take(), &stored.body_ref);
            record
        }))
    }

    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        let mut requests = self.store.inner.requests.lock().unwrap();
        match requests.get_mut(id) {
            Some(stored) => {
                stored.record.status = status;
                Ok(())
            }
            None => Err(RelayError::RecordNotFound { id: id.to_string() }),
        }
    }

    async fn list_pending_for_device(&self, device_id: &str) -> Result<Vec<RelayRequest>> {
        let requests = self.store.inner.requests.lock().unwrap();
        let mut pending: Vec<RelayRequest> = requests
            .values()
            .filter(|stored| {
                stored.record.target_device_id == device_id
                    && stored.record.status == RequestStatus::Pending
            })
            .map(|stored| {
                let mut record = stored.record.clone();
                record.body = self.store.resolve_body(record.body.take(), &stored.body_ref);
                record
            })
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut requests = self.store.inner.requests.lock().unwrap();
        if let Some(stored) = requests.remove(id) {
            self.store.drop_blob(&stored.body_ref);
        }
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut requests = self.store.inner.requests.lock().unwrap();
        let victims: Vec<String> = requests
            .values()
            .filter(|stored| {
                stored.record.status != RequestStatus::Pending
                    && stored.record.created_at < cutoff
            })
            .map(|stored| stored.record.id.clone())
            .take(limit)
            .collect();
        for id in &victims {
            if let Some(stored) = requests.remove(id) {
                self.store.drop_blob(&stored.body_ref);
            }
        }
        Ok(victims.len())
    }
}

/// 内存响应仓储
#[derive(Clone)]
pub struct InMemoryResponseStore {
    store: InMemoryRecordStore,
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn save(&self, response: &RelayResponse) -> Result<()> {
        let (inline, body_ref) = self.store.split_body(&response.body);
        let mut record = response.clone();
        record.body = inline;
        let mut responses = self.store.inner.responses.lock().unwrap();
        if let Some(previous) = responses.remove(&response.id) {
            self.store.drop_blob(&previous.body_ref);
        }
        responses.insert(response.id.clone(), StoredResponse { record, body_ref });
        Ok(())
    }

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<RelayResponse>> {
        let responses = self.store.inner.responses.lock().unwrap();
        // 同一请求以最早写入的一条为准
        Ok(responses
            .values()
            .filter(|stored| stored.record.request_id == request_id)
            .min_by_key(|stored| stored.record.created_at)
            .map(|stored| {
                let mut record = stored.record.clone();
                record.body = self.store.resolve_body(record.body.take(), &stored.body_ref);
                record
            }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut responses = self.store.inner.responses.lock().unwrap();
        if let Some(stored) = responses.remove(id) {
            self.store.drop_blob(&stored.body_ref);
        }
        Ok(())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut responses = self.store.inner.responses.lock().unwrap();
        let victims: Vec<String> = responses
            .values()
            .filter(|stored| stored.record.created_at < cutoff)
            .map(|stored| stored.record.id.clone())
            .take(limit)
            .collect();
        for id in &victims {
            if let Some(stored) = responses.remove(id) {
                self.store.drop_blob(&stored.body_ref);
            }
        }
        Ok(victims.len())
    }
}

/// 内存设备公告仓储
#[derive(Clone)]
pub struct InMemoryAnnouncementStore {
    store: InMemoryRecordStore,
}

#[async_trait]
impl AnnouncementStore for InMemoryAnnouncementStore {
    async fn upsert(&self, announcement: &DeviceAnnouncement) -> Result<()> {
        self.store
            .inner
            .announcements
            .lock()
            .unwrap()
            .insert(announcement.device_id.clone(), announcement.clone());
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<DeviceAnnouncement>> {
        Ok(self
            .store
            .inner
            .announcements
            .lock()
            .unwrap()
            .get(device_id)
            .cloned())
    }

    async fn list_by_kind(&self, kind: DeviceKind) -> Result<Vec<DeviceAnnouncement>> {
        let announcements = self.store.inner.announcements.lock().unwrap();
        let mut result: Vec<DeviceAnnouncement> = announcements
            .values()
            .filter(|ann| ann.device_kind == kind)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(result)
    }

    async fn delete(&self, device_id: &str) -> Result<()> {
        self.store
            .inner
            .announcements
            .lock()
            .unwrap()
            .remove(device_id);
        Ok(())
    }
}
