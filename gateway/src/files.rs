use crate::clock::Clock;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct UploadParams {
    pub tenant_id: Uuid,
    pub filename: String,
    pub purpose: String,
    pub content_type: String,
    /// None keeps the file until deleted.
    pub ttl: Option<Duration>,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: String,
    pub tenant_id: Uuid,
    pub filename: String,
    pub purpose: String,
    pub bytes: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Files port. Object-store / local-disk backends live outside the core;
/// the in-memory implementation below backs tests and single-node runs.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, params: UploadParams) -> Result<StoredFile>;
    async fn download(&self, tenant_id: Uuid, id: &str) -> Result<Option<Bytes>>;
    async fn get(&self, tenant_id: Uuid, id: &str) -> Result<Option<StoredFile>>;
    async fn list(&self, tenant_id: Uuid, limit: usize, after: Option<&str>)
        -> Result<(Vec<StoredFile>, bool)>;
    async fn delete(&self, tenant_id: Uuid, id: &str) -> Result<bool>;
}

pub struct InMemoryFileStore {
    clock: Arc<dyn Clock>,
    inner: Mutex<FileStoreInner>,
}

#[derive(Default)]
struct FileStoreInner {
    // Insertion-ordered ids for cursor pagination.
    order: Vec<String>,
    entries: HashMap<String, (StoredFile, Bytes)>,
}

impl InMemoryFileStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, inner: Mutex::new(FileStoreInner::default()) }
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn upload(&self, params: UploadParams) -> Result<StoredFile> {
        let now = self.clock.now();
        let meta = StoredFile {
            id: format!("file-{}", Uuid::new_v4().simple()),
            tenant_id: params.tenant_id,
            filename: params.filename,
            purpose: params.purpose,
            bytes: params.content.len() as i64,
            created_at: now,
            expires_at: params
                .ttl
                .map(|ttl| now + chrono::Duration::seconds(ttl.as_secs() as i64)),
        };
        let mut guard = self.inner.lock().await;
        guard.order.push(meta.id.clone());
        guard.entries.insert(meta.id.clone(), (meta.clone(), params.content));
        Ok(meta)
    }

    async fn download(&self, tenant_id: Uuid, id: &str) -> Result<Option<Bytes>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .entries
            .get(id)
            .filter(|(meta, _)| meta.tenant_id == tenant_id)
            .map(|(_, content)| content.clone()))
    }

    async fn get(&self, tenant_id: Uuid, id: &str) -> Result<Option<StoredFile>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .entries
            .get(id)
            .filter(|(meta, _)| meta.tenant_id == tenant_id)
            .map(|(meta, _)| meta.clone()))
    }

    async fn list(
        &self,
        tenant_id: Uuid,
        limit: usize,
        after: Option<&str>,
    ) -> Result<(Vec<StoredFile>, bool)> {
        let guard = self.inner.lock().await;
        let start = match after {
            Some(cursor) => guard
                .order
                .iter()
                .position(|id| id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let visible: Vec<StoredFile> = guard.order[start.min(guard.order.len())..]
            .iter()
            .filter_map(|id| guard.entries.get(id))
            .filter(|(meta, _)| meta.tenant_id == tenant_id)
            .map(|(meta, _)| meta.clone())
            .collect();
        let has_more = visible.len() > limit;
        Ok((visible.into_iter().take(limit).collect(), has_more))
    }

    async fn delete(&self, tenant_id: Uuid, id: &str) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let owned = guard
            .entries
            .get(id)
            .map(|(meta, _)| meta.tenant_id == tenant_id)
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        guard.entries.remove(id);
        guard.order.retain(|existing| existing != id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store() -> InMemoryFileStore {
        InMemoryFileStore::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let files = store();
        let tenant = Uuid::new_v4();
        let content = Bytes::from_static(b"{\"a\":1}\n{\"b\":2}\n");
        let meta = files
            .upload(UploadParams {
                tenant_id: tenant,
                filename: "input.jsonl".into(),
                purpose: "batch".into(),
                content_type: "application/jsonl".into(),
                ttl: None,
                content: content.clone(),
            })
            .await
            .unwrap();
        assert_eq!(meta.bytes, content.len() as i64);
        let downloaded = files.download(tenant, &meta.id).await.unwrap().unwrap();
        assert_eq!(downloaded, content);
        // Another tenant cannot see the file.
        assert!(files.download(Uuid::new_v4(), &meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_paginates_with_cursor() {
        let files = store();
        let tenant = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..3 {
            let meta = files
                .upload(UploadParams {
                    tenant_id: tenant,
                    filename: format!("f{i}"),
                    purpose: "batch".into(),
                    content_type: "text/plain".into(),
                    ttl: None,
                    content: Bytes::from_static(b"x"),
                })
                .await
                .unwrap();
            ids.push(meta.id);
        }
        let (page, has_more) = files.list(tenant, 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(has_more);
        let (rest, has_more) = files.list(tenant, 2, Some(&ids[1])).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(!has_more);
        assert_eq!(rest[0].id, ids[2]);
    }
}
