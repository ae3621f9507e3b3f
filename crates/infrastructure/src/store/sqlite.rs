use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{RelayError, Result, StoreConfig};
use relay_domain::entities::{
    DeviceAnnouncement, DeviceKind, RelayRequest, RelayResponse, RequestStatus, ServiceDescriptor,
};
use relay_domain::ports::{AnnouncementStore, RequestStore, ResponseStore};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{headers_from_json, headers_to_json};

/// SQLite记录存储
///
/// 建表在连接时惰性完成，上层永远不会观察到"类型尚未建表"。
/// 超过`inline_body_limit`的二进制体写入独立的blob表并以句柄引用，
/// 序列化边界之上的调用方只看到字节。
pub struct SqliteRecordStore {
    pool: SqlitePool,
    inline_body_limit: usize,
}

impl SqliteRecordStore {
    /// 按配置建立连接池并初始化schema
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect(&config.database_url)
            .await?;
        Self::with_pool(pool, config.inline_body_limit).await
    }

    /// 复用已有连接池
    pub async fn with_pool(pool: SqlitePool, inline_body_limit: usize) -> Result<Self> {
        let store = Self {
            pool,
            inline_body_limit,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// 请求仓储视图
    pub fn requests(&self) -> SqliteRequestStore {
        SqliteRequestStore {
            pool: self.pool.clone(),
            inline_body_limit: self.inline_body_limit,
        }
    }

    /// 响应仓储视图
    pub fn responses(&self) -> SqliteResponseStore {
        SqliteResponseStore {
            pool: self.pool.clone(),
            inline_body_limit: self.inline_body_limit,
        }
    }

    /// 公告仓储视图
    pub fn announcements(&self) -> SqliteAnnouncementStore {
        SqliteAnnouncementStore {
            pool: self.pool.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_requests (
                id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB,
                body_ref TEXT,
                created_at TIMESTAMP NOT NULL,
                target_device_id TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_target_status
             ON relay_requests(target_device_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_responses (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                headers TEXT NOT NULL,
                body BLOB,
                body_ref TEXT,
                error TEXT,
                created_at TIMESTAMP NOT NULL,
                processing_time_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_responses_request
             ON relay_responses(request_id, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_blobs (
                handle TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_announcements (
                device_id TEXT PRIMARY KEY,
                device_name TEXT NOT NULL,
                device_kind TEXT NOT NULL,
                services TEXT NOT NULL,
                last_seen_at TIMESTAMP NOT NULL,
                is_active INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("SQLite schema已就绪");
        Ok(())
    }
}

/// 二进制体写入路由：超限走blob引用，否则内联
async fn write_body(
    pool: &SqlitePool,
    body: &Option<Vec<u8>>,
    inline_body_limit: usize,
) -> Result<(Option<Vec<u8>>, Option<String>)> {
    match body {
        Some(bytes) if bytes.len() > inline_body_limit => {
            let handle = Uuid::new_v4().to_string();
            sqlx::query("INSERT INTO relay_blobs (handle, data, created_at) VALUES ($1, $2, $3)")
                .bind(&handle)
                .bind(bytes.as_slice())
                .bind(Utc::now())
                .execute(pool)
                .await?;
            debug!(handle = %handle, size = bytes.len(), "请求体超限，已写入blob引用");
            Ok((None, Some(handle)))
        }
        _ => Ok((body.clone(), None)),
    }
}

/// 二进制体读取路由：引用句柄透明解引用
async fn read_body(
    pool: &SqlitePool,
    inline: Option<Vec<u8>>,
    body_ref: Option<String>,
) -> Result<Option<Vec<u8>>> {
    match body_ref {
        Some(handle) => {
            let row = sqlx::query("SELECT data FROM relay_blobs WHERE handle = $1")
                .bind(&handle)
                .fetch_optional(pool)
                .await?;
            match row {
                Some(row) => Ok(Some(row.try_get("data")?)),
                None => {
                    warn!(handle = %handle, "blob引用缺失，按空体返回");
                    Ok(None)
                }
            }
        }
        None => Ok(inline),
    }
}

async fn delete_blob(pool: &SqlitePool, handle: &str) -> Result<()> {
    sqlx::query("DELETE FROM relay_blobs WHERE handle = $1")
        .bind(handle)
        .execute(pool)
        .await?;
    Ok(())
}

/// SQLite请求仓储
pub struct SqliteRequestStore {
    pool: SqlitePool,
    inline_body_limit: usize,
}

impl SqliteRequestStore {
    async fn row_to_request(&self, row: &SqliteRow) -> Result<RelayRequest> {
        let headers: String = row.try_get("headers")?;
        let inline: Option<Vec<u8>> = row.try_get("body")?;
        let body_ref: Option<String> = row.try_get("body_ref")?;
        Ok(RelayRequest {
            id: row.try_get("id")?,
            service_id: row.try_get("service_id")?,
            service_name: row.try_get("service_name")?,
            endpoint: row.try_get("endpoint")?,
            method: row.try_get("method")?,
            headers: headers_from_json(&headers)?,
            body: read_body(&self.pool, inline, body_ref).await?,
            created_at: row.try_get("created_at")?,
            target_device_id: row.try_get("target_device_id")?,
            status: row.try_get("status")?,
        })
    }
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn save(&self, request: &RelayRequest) -> Result<()> {
        let (inline, body_ref) =
            write_body(&self.pool, &request.body, self.inline_body_limit).await?;
        sqlx::query(
            r#"
            INSERT INTO relay_requests
                (id, service_id, service_name, endpoint, method, headers, body, body_ref,
                 created_at, target_device_id, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT(id) DO UPDATE SET
                headers = excluded.headers,
                body = excluded.body,
                body_ref = excluded.body_ref,
                status = excluded.status
            "#,
        )
        .bind(&request.id)
        .bind(&request.service_id)
        .bind(&request.service_name)
        .bind(&request.endpoint)
        .bind(&request.method)
        .bind(headers_to_json(&request.headers)?)
        .bind(inline)
        .bind(body_ref)
        .bind(request.created_at)
        .bind(&request.target_device_id)
        .bind(request.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<RelayRequest>> {
        let row = sqlx::query("SELECT * FROM relay_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_request(&row).await?)),
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        let result = sqlx::query("UPDATE relay_requests SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RelayError::RecordNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn list_pending_for_device(&self, device_id: &str) -> Result<Vec<RelayRequest>> {
        let rows = sqlx::query(
            "SELECT * FROM relay_requests
             WHERE target_device_id = $1 AND status = $2
             ORDER BY created_at ASC",
        )
        .bind(device_id)
        .bind(RequestStatus::Pending)
        .fetch_all(&self.pool)
        .await?;
        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            requests.push(self.row_to_request(row).await?);
        }
        Ok(requests)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let row = sqlx::query("SELECT body_ref FROM relay_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            if let Some(handle) = row.try_get::<Option<String>, _>("body_ref")? {
                delete_blob(&self.pool, &handle).await?;
            }
        }
        sqlx::query("DELETE FROM relay_requests WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT id, body_ref FROM relay_requests
             WHERE status != $1 AND created_at < $2
             ORDER BY created_at ASC LIMIT $3",
        )
        .bind(RequestStatus::Pending)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut deleted = 0usize;
        for row in &rows {
            let id: String = row.try_get("id")?;
            if let Some(handle) = row.try_get::<Option<String>, _>("body_ref")? {
                delete_blob(&self.pool, &handle).await?;
            }
            deleted += sqlx::query("DELETE FROM relay_requests WHERE id = $1")
                .bind(&id)
                .execute(&self.pool)
                .await?
                .rows_affected() as usize;
        }
        Ok(deleted)
    }
}

/// SQLite响应仓储
pub struct SqliteResponseStore {
    pool: SqlitePool,
    inline_body_limit: usize,
}

impl SqliteResponseStore {
    async fn row_to_response(&self, row: &SqliteRow) -> Result<RelayResponse> {
        let headers: String = row.try_get("headers")?;
        let inline: Option<Vec<u8>> = row.try_get("body")?;
        let body_ref: Option<String> = row.try_get("body_ref")?;
        let status_code: i64 = row.try_get("status_code")?;
        let processing_time_ms: i64 = row.try_get("processing_time_ms")?;
        Ok(RelayResponse {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            status_code: status_code as u16,
            headers: headers_from_json(&headers)?,
            body: read_body(&self.pool, inline, body_ref).await?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            processing_time_ms: processing_time_ms as u64,
        })
    }
}

#[async_trait]
impl ResponseStore for SqliteResponseStore {
    async fn save(&self, response: &RelayResponse) -> Result<()> {
        let (inline, body_ref) =
            write_body(&self.pool, &response.body, self.inline_body_limit).await?;
        sqlx::query(
            r#"
            INSERT INTO relay_responses
                (id, request_id, status_code, headers, body, body_ref, error,
                 created_at, processing_time_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(id) DO UPDATE SET
                headers = excluded.headers,
                body = excluded.body,
                body_ref = excluded.body_ref,
                error = excluded.error
            "#,
        )
        .bind(&response.id)
        .bind(&response.request_id)
        .bind(response.status_code as i64)
        .bind(headers_to_json(&response.headers)?)
        .bind(inline)
        .bind(body_ref)
        .bind(&response.error)
        .bind(response.created_at)
        .bind(response.processing_time_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<RelayResponse>> {
        let row = sqlx::query(
            "SELECT * FROM relay_responses WHERE request_id = $1
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_response(&row).await?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let row = sqlx::query("SELECT body_ref FROM relay_responses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            if let Some(handle) = row.try_get::<Option<String>, _>("body_ref")? {
                delete_blob(&self.pool, &handle).await?;
            }
        }
        sqlx::query("DELETE FROM relay_responses WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT id, body_ref FROM relay_responses
             WHERE created_at < $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut deleted = 0usize;
        for row in &rows {
            let id: String = row.try_get("id")?;
            if let Some(handle) = row.try_get::<Option<String>, _>("body_ref")? {
                delete_blob(&self.pool, &handle).await?;
            }
            deleted += sqlx::query("DELETE FROM relay_responses WHERE id = $1")
                .bind(&id)
                .execute(&self.pool)
                .await?
                .rows_affected() as usize;
        }
        Ok(deleted)
    }
}

/// SQLite设备公告仓储
pub struct SqliteAnnouncementStore {
    pool: SqlitePool,
}

impl SqliteAnnouncementStore {
    fn row_to_announcement(row: &SqliteRow) -> Result<DeviceAnnouncement> {
        let kind: String = row.try_get("device_kind")?;
        let services: String = row.try_get("services")?;
        let services: Vec<ServiceDescriptor> = serde_json::from_str(&services)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        Ok(DeviceAnnouncement {
            device_id: row.try_get("device_id")?,
            device_name: row.try_get("device_name")?,
            device_kind: DeviceKind::from_str(&kind).map_err(RelayError::Serialization)?,
            services,
            last_seen_at: row.try_get("last_seen_at")?,
            is_active: row.try_get("is_active")?,
        })
    }
}

#[async_trait]
impl AnnouncementStore for SqliteAnnouncementStore {
    async fn upsert(&self, announcement: &DeviceAnnouncement) -> Result<()> {
        let services = serde_json::to_string(&announcement.services)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO device_announcements
                (device_id, device_name, device_kind, services, last_seen_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(device_id) DO UPDATE SET
                device_name = excluded.device_name,
                device_kind = excluded.device_kind,
                services = excluded.services,
                last_seen_at = excluded.last_seen_at,
                is_active = excluded.is_active
            "#,
        )
        .bind(&announcement.device_id)
        .bind(&announcement.device_name)
        .bind(announcement.device_kind.as_str())
        .bind(services)
        .bind(announcement.last_seen_at)
        .bind(announcement.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<DeviceAnnouncement>> {
        let row = sqlx::query("SELECT * FROM device_announcements WHERE device_id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::row_to_announcement(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_by_kind(&self, kind: DeviceKind) -> Result<Vec<DeviceAnnouncement>> {
        let rows = sqlx::query(
            "SELECT * FROM device_announcements WHERE device_kind = $1
             ORDER BY last_seen_at DESC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_announcement).collect()
    }

    async fn delete(&self, device_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM device_announcements WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use relay_domain::entities::{ApiFormat, ServiceKind};
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    const TEST_INLINE_LIMIT: usize = 64;

    async fn open_store() -> (SqliteRecordStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("relay.db").to_str().unwrap()
        );
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        let store = SqliteRecordStore::with_pool(pool, TEST_INLINE_LIMIT)
            .await
            .unwrap();
        (store, dir)
    }

    fn sample_request(device: &str, body: Option<Vec<u8>>) -> RelayRequest {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        RelayRequest::new("svc-1", "ollama", "/api/chat", "POST", headers, body, device)
    }

    #[tokio::test]
    async fn test_request_save_fetch_round_trip() {
        let (store, _dir) = open_store().await;
        let requests = store.requests();
        let request = sample_request("dev-1", Some(b"{\"x\":1}".to_vec()));
        requests.save(&request).await.unwrap();

        let fetched = requests.get_by_id(&request.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, request.id);
        assert_eq!(fetched.body, request.body);
        assert_eq!(fetched.headers, request.headers);
        assert_eq!(fetched.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_body_size_routing() {
        let (store, _dir) = open_store().await;
        let requests = store.requests();

        // 阈值以下内联存储
        let small = sample_request("dev-1", Some(vec![7u8; TEST_INLINE_LIMIT - 1]));
        requests.save(&small).await.unwrap();
        // 阈值以上走blob引用路径
        let large = sample_request("dev-1", Some(vec![9u8; TEST_INLINE_LIMIT + 1]));
        requests.save(&large).await.unwrap();

        let row = sqlx::query("SELECT body_ref FROM relay_requests WHERE id = $1")
            .bind(&small.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(row
            .try_get::<Option<String>, _>("body_ref")
            .unwrap()
            .is_none());

        let row = sqlx::query("SELECT body, body_ref FROM relay_requests WHERE id = $1")
            .bind(&large.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(row.try_get::<Option<Vec<u8>>, _>("body").unwrap().is_none());
        assert!(row
            .try_get::<Option<String>, _>("body_ref")
            .unwrap()
            .is_some());

        // 两条路径读回的字节完全一致
        let fetched = requests.get_by_id(&small.id).await.unwrap().unwrap();
        assert_eq!(fetched.body.unwrap(), vec![7u8; TEST_INLINE_LIMIT - 1]);
        let fetched = requests.get_by_id(&large.id).await.unwrap().unwrap();
        assert_eq!(fetched.body.unwrap(), vec![9u8; TEST_INLINE_LIMIT + 1]);
    }

    #[tokio::test]
    async fn test_list_pending_filters_by_device_and_status() {
        let (store, _dir) = open_store().await;
        let requests = store.requests();
        let mine = sample_request("dev-1", None);
        let other = sample_request("dev-2", None);
        let mut done = sample_request("dev-1", None);
        done.status = RequestStatus::Completed;
        requests.save(&mine).await.unwrap();
        requests.save(&other).await.unwrap();
        requests.save(&done).await.unwrap();

        let pending = requests.list_pending_for_device("dev-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, mine.id);
    }

    #[tokio::test]
    async fn test_update_status_missing_record() {
        let (store, _dir) = open_store().await;
        let result = store
            .requests()
            .update_status("ghost", RequestStatus::Processing)
            .await;
        assert!(matches!(result, Err(RelayError::RecordNotFound { .. })));
    }

    #[tokio::test]
    async fn test_first_response_is_canonical() {
        let (store, _dir) = open_store().await;
        let responses = store.responses();
        let request = sample_request("dev-1", None);

        let mut first = RelayResponse::new(&request.id, 200, HashMap::new(), None, 5);
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = RelayResponse::new(&request.id, 502, HashMap::new(), None, 9);
        responses.save(&second).await.unwrap();
        responses.save(&first).await.unwrap();

        let canonical = responses
            .find_by_request_id(&request.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canonical.id, first.id);
        assert_eq!(canonical.status_code, 200);
    }

    #[tokio::test]
    async fn test_delete_finished_preserves_pending() {
        let (store, _dir) = open_store().await;
        let requests = store.requests();
        let mut old_done = sample_request("dev-1", None);
        old_done.status = RequestStatus::Completed;
        old_done.created_at = Utc::now() - chrono::Duration::hours(48);
        let mut old_pending = sample_request("dev-1", None);
        old_pending.created_at = Utc::now() - chrono::Duration::hours(48);
        requests.save(&old_done).await.unwrap();
        requests.save(&old_pending).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let deleted = requests.delete_finished_before(cutoff, 100).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(requests.get_by_id(&old_done.id).await.unwrap().is_none());
        // PENDING的请求不论多旧都保留
        assert!(requests.get_by_id(&old_pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_announcement_upsert_overwrites_in_place() {
        let (store, _dir) = open_store().await;
        let announcements = store.announcements();
        let mut ann = DeviceAnnouncement {
            device_id: "dev-1".to_string(),
            device_name: "主机".to_string(),
            device_kind: DeviceKind::Desktop,
            services: vec![ServiceDescriptor {
                id: "svc-1".to_string(),
                name: "ollama".to_string(),
                kind: ServiceKind::LanguageModel,
                port: 11434,
                api_format: ApiFormat::ChatCompletions,
                is_running: true,
                base_url: None,
                workflows: None,
            }],
            last_seen_at: Utc::now(),
            is_active: true,
        };
        announcements.upsert(&ann).await.unwrap();

        ann.is_active = false;
        ann.services.clear();
        announcements.upsert(&ann).await.unwrap();

        let all = announcements.list_by_kind(DeviceKind::Desktop).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].is_active);
        assert!(all[0].services.is_empty());
    }
}
