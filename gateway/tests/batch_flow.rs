mod support;

use async_trait::async_trait;
use model_gateway::batch::BatchWorker;
use model_gateway::files::FileStore;
use model_gateway::providers::{Chat, ProviderError, ProviderResult};
use model_gateway::store::{BatchStatus, InMemoryStore, NewBatch, Store};
use model_gateway::wire::{BatchErrorLine, BatchOutputLine, ChatRequest, ChatResponse};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use support::*;
use tokio::sync::watch;
use uuid::Uuid;

fn chat_line(custom_id: &str, model: &str) -> Value {
    json!({
        "custom_id": custom_id,
        "method": "POST",
        "url": "/v1/chat/completions",
        "body": {"model": model, "messages": [{"role": "user", "content": "hi"}]}
    })
}

fn items_from(lines: &[Value]) -> Vec<(Option<String>, Value)> {
    lines
        .iter()
        .map(|line| {
            let custom_id = line
                .get("custom_id")
                .and_then(|c| c.as_str())
                .map(|c| c.to_string());
            (custom_id, line.clone())
        })
        .collect()
}

fn worker_for(h: &Harness) -> BatchWorker {
    let (_tx, rx) = watch::channel(false);
    BatchWorker::new(
        h.store.clone(),
        h.files.clone(),
        h.state.executor.clone(),
        h.state.contexts.clone(),
        h.clock.clone(),
        std::time::Duration::from_millis(10),
        std::time::Duration::from_millis(10),
        rx,
    )
}

async fn create_batch(
    store: &InMemoryStore,
    seeded: &Seeded,
    lines: &[Value],
) -> model_gateway::store::BatchRow {
    store
        .create_batch(
            NewBatch {
                tenant_id: seeded.tenant_id,
                api_key_id: seeded.api_key_id,
                endpoint: "/v1/chat/completions".into(),
                input_file_id: "file-test".into(),
                completion_window: "24h".into(),
                max_concurrency: 1,
                metadata: None,
                expires_at: None,
            },
            items_from(lines),
            frozen_now(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn batch_happy_path_completes_with_output_file() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let ok = OkChat::new("batched answer", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;

    let lines: Vec<Value> = (0..3).map(|i| chat_line(&format!("c{i}"), "gpt-mini")).collect();
    create_batch(&store, &seeded, &lines).await;

    let worker = worker_for(&h);
    let claimed = store.claim_next_batch(frozen_now()).await.unwrap().unwrap();
    assert_eq!(claimed.status, BatchStatus::InProgress);
    worker.process_batch(claimed.clone()).await.unwrap();

    let finished = store.get_batch(None, claimed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(
        (finished.total, finished.completed, finished.failed, finished.cancelled),
        (3, 3, 0, 0)
    );
    assert!(finished.error_file_id.is_none());

    let output_id = finished.output_file_id.expect("output file");
    let content = h.files.download(seeded.tenant_id, &output_id).await.unwrap().unwrap();
    let text = String::from_utf8(content.to_vec()).unwrap();
    let parsed: Vec<BatchOutputLine> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(parsed.len(), 3);
    assert_eq!(parsed[0].custom_id.as_deref(), Some("c0"));
    assert_eq!(parsed[0].response["choices"][0]["message"]["content"], "batched answer");

    // Re-serializing each line reproduces the stored line content.
    for (line, entry) in text.lines().zip(&parsed) {
        assert_eq!(line, serde_json::to_string(entry).unwrap());
    }

    // Every item is terminal and the executor recorded per-item usage.
    for item in store.items_of(claimed.id).await {
        assert_eq!(item.status, model_gateway::store::BatchItemStatus::Completed);
    }
    assert_eq!(store.usage_rows().await.len(), 3);
    assert_eq!(ok.call_count(), 3);
}

/// Chat backend that cancels the batch through the store after N successes.
struct CancelAfterChat {
    inner: Arc<OkChat>,
    store: Arc<InMemoryStore>,
    tenant_id: Uuid,
    batch_id: Mutex<Option<Uuid>>,
    cancel_after: usize,
    successes: AtomicUsize,
}

#[async_trait]
impl Chat for CancelAfterChat {
    async fn chat(&self, model: &str, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        let resp = self.inner.chat(model, req).await?;
        let count = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.cancel_after {
            let batch_id = self.batch_id.lock().unwrap().expect("batch id set");
            self.store
                .cancel_batch(self.tenant_id, batch_id, chrono::Utc::now())
                .await
                .map_err(|err| ProviderError::new(None, err.to_string()))?;
        }
        Ok(resp)
    }
}

#[tokio::test]
async fn batch_cancellation_stops_claims_and_counts_remaining() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let cancelling = Arc::new(CancelAfterChat {
        inner: OkChat::new("answer", 10, 5),
        store: store.clone(),
        tenant_id: seeded.tenant_id,
        batch_id: Mutex::new(None),
        cancel_after: 4,
        successes: AtomicUsize::new(0),
    });
    let h = harness(
        store.clone(),
        ScriptedSource::default().with_chat("p1", cancelling.clone()),
    )
    .await;

    let lines: Vec<Value> = (0..10).map(|i| chat_line(&format!("c{i}"), "gpt-mini")).collect();
    let created = create_batch(&store, &seeded, &lines).await;
    *cancelling.batch_id.lock().unwrap() = Some(created.id);

    let worker = worker_for(&h);
    let claimed = store.claim_next_batch(frozen_now()).await.unwrap().unwrap();
    worker.process_batch(claimed.clone()).await.unwrap();

    let finished = store.get_batch(None, claimed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Cancelled);
    assert_eq!(finished.completed, 4);
    assert_eq!(
        finished.completed + finished.failed + finished.cancelled,
        finished.total
    );

    let output_id = finished.output_file_id.expect("partial output file");
    let content = h.files.download(seeded.tenant_id, &output_id).await.unwrap().unwrap();
    assert_eq!(content.iter().filter(|b| **b == b'\n').count(), 4);
}

#[tokio::test]
async fn revoked_key_fails_whole_batch_with_context_error() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let ok = OkChat::new("unused", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;

    let lines: Vec<Value> = (0..3).map(|i| chat_line(&format!("c{i}"), "gpt-mini")).collect();
    create_batch(&store, &seeded, &lines).await;
    store.revoke_api_key(seeded.api_key_id, frozen_now()).await;

    let worker = worker_for(&h);
    let claimed = store.claim_next_batch(frozen_now()).await.unwrap().unwrap();
    worker.process_batch(claimed.clone()).await.unwrap();

    let finished = store.get_batch(None, claimed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(finished.failed, 3);
    assert_eq!(ok.call_count(), 0);

    let error_id = finished.error_file_id.expect("error file");
    let content = h.files.download(seeded.tenant_id, &error_id).await.unwrap().unwrap();
    let text = String::from_utf8(content.to_vec()).unwrap();
    for line in text.lines() {
        let entry: BatchErrorLine = serde_json::from_str(line).unwrap();
        assert_eq!(entry.error.code, "context_error");
    }
}

#[tokio::test]
async fn invalid_items_map_to_specific_error_codes() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let ok = OkChat::new("unused", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;

    let lines = vec![
        Value::String("not json at all".into()),
        json!({"custom_id": "wrong-url", "method": "POST", "url": "/v1/embeddings",
               "body": {"model": "gpt-mini", "input": "x"}}),
        json!({"custom_id": "wrong-method", "method": "GET", "url": "/v1/chat/completions",
               "body": {"model": "gpt-mini", "messages": []}}),
        json!({"custom_id": "no-model", "method": "POST", "url": "/v1/chat/completions",
               "body": {"messages": []}}),
        json!({"custom_id": "streaming", "method": "POST", "url": "/v1/chat/completions",
               "body": {"model": "gpt-mini", "messages": [], "stream": true}}),
    ];
    create_batch(&store, &seeded, &lines).await;

    let worker = worker_for(&h);
    let claimed = store.claim_next_batch(frozen_now()).await.unwrap().unwrap();
    worker.process_batch(claimed.clone()).await.unwrap();

    let finished = store.get_batch(None, claimed.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(finished.failed, 5);

    let error_id = finished.error_file_id.expect("error file");
    let content = h.files.download(seeded.tenant_id, &error_id).await.unwrap().unwrap();
    let text = String::from_utf8(content.to_vec()).unwrap();
    let codes: Vec<String> = text
        .lines()
        .map(|line| serde_json::from_str::<BatchErrorLine>(line).unwrap().error.code)
        .collect();
    assert_eq!(
        codes,
        vec![
            "invalid_batch_input",
            "invalid_endpoint",
            "invalid_method",
            "invalid_request_error",
            "invalid_request_error",
        ]
    );
    assert_eq!(ok.call_count(), 0);
}

#[tokio::test]
async fn item_claims_respect_max_concurrency_ceiling() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;

    let lines: Vec<Value> = (0..3).map(|i| chat_line(&format!("c{i}"), "gpt-mini")).collect();
    let created = store
        .create_batch(
            NewBatch {
                tenant_id: seeded.tenant_id,
                api_key_id: seeded.api_key_id,
                endpoint: "/v1/chat/completions".into(),
                input_file_id: "file-test".into(),
                completion_window: "24h".into(),
                max_concurrency: 1,
                metadata: None,
                expires_at: None,
            },
            items_from(&lines),
            frozen_now(),
        )
        .await
        .unwrap();

    // One item in flight fills the ceiling; a second claim must wait.
    let first = store.claim_next_item(created.id).await.unwrap().unwrap();
    assert!(store.claim_next_item(created.id).await.unwrap().is_none());

    store.complete_item(first.id, json!({"ok": true})).await.unwrap();
    let second = store.claim_next_item(created.id).await.unwrap().unwrap();
    assert_eq!(second.item_index, 1);
}

#[tokio::test]
async fn expired_batch_finalizes_as_expired() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let ok = OkChat::new("unused", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;

    let lines: Vec<Value> = (0..2).map(|i| chat_line(&format!("c{i}"), "gpt-mini")).collect();
    let created = store
        .create_batch(
            NewBatch {
                tenant_id: seeded.tenant_id,
                api_key_id: seeded.api_key_id,
                endpoint: "/v1/chat/completions".into(),
                input_file_id: "file-test".into(),
                completion_window: "24h".into(),
                max_concurrency: 1,
                metadata: None,
                expires_at: Some(frozen_now() - chrono::Duration::hours(1)),
            },
            items_from(&lines),
            frozen_now() - chrono::Duration::hours(25),
        )
        .await
        .unwrap();

    let worker = worker_for(&h);
    let claimed = store.claim_next_batch(frozen_now()).await.unwrap().unwrap();
    worker.process_batch(claimed).await.unwrap();

    let finished = store.get_batch(None, created.id).await.unwrap().unwrap();
    assert_eq!(finished.status, BatchStatus::Expired);
    assert_eq!(finished.cancelled, 2);
    assert_eq!(ok.call_count(), 0);
}
