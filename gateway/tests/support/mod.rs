#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use model_gateway::app::AppState;
use model_gateway::clock::ManualClock;
use model_gateway::config::GatewayConfig;
use model_gateway::counter::InMemoryCounterStore;
use model_gateway::files::InMemoryFileStore;
use model_gateway::providers::{
    Capabilities, CapabilitySource, Chat, ChatStream, ChunkStream, ProviderError, ProviderResult,
};
use model_gateway::store::{
    ApiKeyRow, BudgetRow, CatalogEntry, InMemoryStore, LimitOverride, NewRequestRecord,
    NewUsageRecord, Store, TenantRow, TenantStatus,
};
use model_gateway::wire::{
    ChatChoice, ChatChunk, ChatMessage, ChatRequest, ChatResponse, ChunkChoice, ChunkDelta, Usage,
};
use serde_json::{json, Map};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const FROZEN_NOW: &str = "2026-03-15T12:00:00Z";

pub fn frozen_now() -> DateTime<Utc> {
    FROZEN_NOW.parse().unwrap()
}

pub fn test_config() -> Arc<GatewayConfig> {
    Arc::new(GatewayConfig {
        bind_addr: "127.0.0.1:0".into(),
        database_url: "postgres://unused".into(),
        redis_url: None,
        redis_prefix: "test".into(),
        default_rpm: 600,
        default_tpm: 1_000_000,
        default_parallel: 32,
        default_budget_cents: 100_000,
        default_warning_threshold: 0.8,
        default_budget_schedule: "calendar_month".into(),
        alert_cooldown_secs: 3600,
        alert_webhook_max_retries: 2,
        key_refresh_secs: 60,
        batch_workers: 1,
        batch_poll_interval: Duration::from_millis(20),
        batch_error_backoff: Duration::from_millis(20),
        sync_timeout: Duration::from_secs(30),
        stream_max_duration: Duration::from_secs(60),
        stream_idle_timeout: Duration::from_secs(10),
        provider_timeout: Duration::from_secs(5),
        smtp_host: None,
        smtp_port: 587,
        smtp_from: None,
        smtp_username: None,
        smtp_password: None,
        router_health_window: 8,
        router_failure_threshold: 0.5,
        router_health_cooldown: Duration::from_millis(100),
        openai_api_key: None,
        openai_base_url: "https://unused.test".into(),
        anthropic_api_key: None,
        anthropic_base_url: "https://unused.test".into(),
    })
}

/// Provider-name → capabilities map for tests.
#[derive(Default)]
pub struct ScriptedSource {
    pub backends: HashMap<String, Capabilities>,
}

impl ScriptedSource {
    pub fn with_chat(mut self, provider: &str, chat: Arc<dyn Chat>) -> Self {
        let caps = self.backends.entry(provider.to_string()).or_default();
        caps.chat = Some(chat);
        self
    }

    pub fn with_stream(mut self, provider: &str, stream: Arc<dyn ChatStream>) -> Self {
        let caps = self.backends.entry(provider.to_string()).or_default();
        caps.chat_stream = Some(stream);
        self
    }
}

impl CapabilitySource for ScriptedSource {
    fn capabilities(&self, provider: &str) -> Option<Capabilities> {
        self.backends.get(provider).cloned()
    }
}

pub fn canned_response(model: &str, text: &str, usage: Usage) -> ChatResponse {
    ChatResponse {
        id: "chatcmpl-test".into(),
        object: "chat.completion".into(),
        created: 1_700_000_000,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".into(),
                content: json!(text),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: Some("stop".into()),
            extra: Map::new(),
        }],
        usage,
        extra: Map::new(),
    }
}

/// Chat backend returning a canned response and counting invocations.
pub struct OkChat {
    pub text: String,
    pub usage: Usage,
    pub calls: AtomicUsize,
}

impl OkChat {
    pub fn new(text: &str, prompt: i64, completion: i64) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            usage: Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            },
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Chat for OkChat {
    async fn chat(&self, model: &str, _req: &ChatRequest) -> ProviderResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(canned_response(model, &self.text, self.usage.clone()))
    }
}

/// Chat backend that always fails with the given status.
pub struct FailChat {
    pub status: u16,
    pub calls: AtomicUsize,
}

impl FailChat {
    pub fn new(status: u16) -> Arc<Self> {
        Arc::new(Self { status, calls: AtomicUsize::new(0) })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Chat for FailChat {
    async fn chat(&self, _model: &str, _req: &ChatRequest) -> ProviderResult<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::new(Some(self.status), "scripted failure"))
    }
}

/// Streaming backend emitting the given text pieces then a usage-bearing
/// final chunk.
pub struct ScriptedStream {
    pub pieces: Vec<String>,
    pub usage: Usage,
}

impl ScriptedStream {
    pub fn new(pieces: &[&str], prompt: i64, completion: i64) -> Arc<Self> {
        Arc::new(Self {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            usage: Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            },
        })
    }
}

fn text_chunk(model: &str, content: Option<String>, usage: Option<Usage>) -> ChatChunk {
    ChatChunk {
        id: "chatcmpl-test".into(),
        object: "chat.completion.chunk".into(),
        created: 1_700_000_000,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { role: None, content, extra: Map::new() },
            finish_reason: if usage.is_some() { Some("stop".into()) } else { None },
        }],
        usage,
        extra: Map::new(),
    }
}

#[async_trait]
impl ChatStream for ScriptedStream {
    async fn stream(&self, model: &str, _req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let mut chunks: Vec<ProviderResult<ChatChunk>> = self
            .pieces
            .iter()
            .map(|piece| Ok(text_chunk(model, Some(piece.clone()), None)))
            .collect();
        chunks.push(Ok(text_chunk(model, None, Some(self.usage.clone()))));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

// ---------------- seeding ----------------

pub struct Seeded {
    pub tenant_id: Uuid,
    pub api_key_id: Uuid,
    pub bearer: String,
}

pub async fn seed_tenant_and_key(store: &InMemoryStore) -> Seeded {
    seed_tenant_and_key_with_limits(store, LimitOverride::default()).await
}

pub async fn seed_tenant_and_key_with_limits(
    store: &InMemoryStore,
    key_limits: LimitOverride,
) -> Seeded {
    let tenant_id = Uuid::new_v4();
    store
        .insert_tenant(TenantRow {
            id: tenant_id,
            name: format!("tenant-{tenant_id}"),
            status: TenantStatus::Active,
            kind: "organization".into(),
            limits: LimitOverride::default(),
        })
        .await;
    let api_key_id = Uuid::new_v4();
    let prefix = format!("pfx{}", &api_key_id.simple().to_string()[..8]);
    let secret = "s3cr3t";
    store
        .insert_api_key(ApiKeyRow {
            id: api_key_id,
            tenant_id,
            prefix: prefix.clone(),
            secret_hash: model_gateway::hash_secret(secret),
            name: "test key".into(),
            scopes: vec![],
            kind: "service".into(),
            owner_user_id: None,
            revoked_at: None,
            last_used_at: None,
            limits: key_limits,
        })
        .await;
    Seeded { tenant_id, api_key_id, bearer: format!("Bearer sk-{prefix}.{secret}") }
}

pub fn catalog_entry(alias: &str, provider: &str, model: &str, weight: i32) -> CatalogEntry {
    CatalogEntry {
        id: Uuid::new_v4(),
        alias: alias.to_string(),
        provider: provider.to_string(),
        provider_model: model.to_string(),
        context_window: 128_000,
        max_output_tokens: 4096,
        modalities: vec!["text".into()],
        supports_tools: true,
        price_input: BigDecimal::from_str("0.50").unwrap(),
        price_output: BigDecimal::from_str("1.50").unwrap(),
        currency: "USD".into(),
        enabled: true,
        weight,
        metadata: json!({}),
        created_at: frozen_now(),
    }
}

pub fn budget_row(tenant_id: Uuid, limit_cents: i64) -> BudgetRow {
    BudgetRow {
        tenant_id,
        limit_cents,
        warning_threshold: 0.8,
        refresh_schedule: "calendar_month".into(),
        alert_emails: vec![],
        alert_webhooks: vec![],
        alert_cooldown_secs: 3600,
        last_alert_at: None,
        last_alert_level: None,
    }
}

/// Seed prior spend: one success request row plus its usage row.
pub async fn seed_usage(store: &InMemoryStore, tenant_id: Uuid, cents: i64, ts: DateTime<Utc>) {
    store
        .insert_request(
            NewRequestRecord {
                tenant_id,
                api_key_id: None,
                ts,
                alias: "gpt-mini".into(),
                provider: "openai".into(),
                latency_ms: 10,
                status: 200,
                error_code: None,
                input_tokens: 100,
                output_tokens: 100,
                cost_cents: cents,
                cost_usd_micros: cents * 10_000,
                idempotency_key: None,
                trace_id: None,
                response: None,
            },
            Some(NewUsageRecord {
                tenant_id,
                api_key_id: None,
                ts,
                alias: "gpt-mini".into(),
                provider: "openai".into(),
                input_tokens: 100,
                output_tokens: 100,
                cost_cents: cents,
                cost_usd_micros: cents * 10_000,
            }),
        )
        .await
        .unwrap();
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub counter: Arc<InMemoryCounterStore>,
    pub files: Arc<InMemoryFileStore>,
    pub clock: Arc<ManualClock>,
}

/// Full service container over in-memory ports and scripted providers.
pub async fn harness(store: Arc<InMemoryStore>, source: ScriptedSource) -> Harness {
    let clock = Arc::new(ManualClock::new(frozen_now()));
    let counter = Arc::new(InMemoryCounterStore::new());
    let files = Arc::new(InMemoryFileStore::new(clock.clone()));
    let state = AppState::assemble(
        test_config(),
        store.clone(),
        files.clone(),
        counter.clone(),
        Arc::new(source),
        clock.clone(),
    )
    .await
    .expect("assemble test state");
    Harness { state, store, counter, files, clock }
}
