use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub mod memory;
pub mod pg;

pub use memory::InMemoryStore;
pub use pg::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
        }
    }

    pub fn from_str(s: &str) -> Option<TenantStatus> {
        match s {
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantRow {
    pub id: Uuid,
    pub name: String,
    pub status: TenantStatus,
    pub kind: String,
    pub limits: LimitOverride,
}

/// Per-layer rate-limit override; `None` fields inherit the wider layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOverride {
    pub requests_per_minute: Option<i32>,
    pub tokens_per_minute: Option<i32>,
    pub parallel_requests: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub prefix: String,
    pub secret_hash: String,
    pub name: String,
    pub scopes: Vec<String>,
    pub kind: String,
    pub owner_user_id: Option<Uuid>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub limits: LimitOverride,
}

impl ApiKeyRow {
    pub fn revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: Uuid,
    pub alias: String,
    pub provider: String,
    pub provider_model: String,
    pub context_window: i32,
    pub max_output_tokens: i32,
    pub modalities: Vec<String>,
    pub supports_tools: bool,
    /// USD per 1000 tokens.
    pub price_input: BigDecimal,
    pub price_output: BigDecimal,
    pub currency: String,
    pub enabled: bool,
    pub weight: i32,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BudgetRow {
    pub tenant_id: Uuid,
    pub limit_cents: i64,
    pub warning_threshold: f64,
    pub refresh_schedule: String,
    pub alert_emails: Vec<String>,
    pub alert_webhooks: Vec<String>,
    pub alert_cooldown_secs: i64,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub last_alert_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GuardrailPolicyRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub keywords: Vec<String>,
    pub moderation_url: Option<String>,
    pub timeout_ms: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewRequestRecord {
    pub tenant_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    pub alias: String,
    pub provider: String,
    pub latency_ms: i64,
    pub status: i32,
    pub error_code: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_cents: i64,
    pub cost_usd_micros: i64,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    /// Serialized success payload, kept only for idempotent replay.
    pub response: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub tenant_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
    pub alias: String,
    pub provider: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_cents: i64,
    pub cost_usd_micros: i64,
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: i32,
    pub idempotency_key: Option<String>,
    pub response: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NewAlertEvent {
    pub tenant_id: Uuid,
    pub level: String,
    pub channels: Vec<String>,
    pub payload: Value,
    pub success: bool,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGuardrailEvent {
    pub tenant_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub stage: String,
    pub action: String,
    pub category: Option<String>,
    pub detail: Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
    Expired,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Validating => "validating",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelling => "cancelling",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<BatchStatus> {
        match s {
            "validating" => Some(BatchStatus::Validating),
            "in_progress" => Some(BatchStatus::InProgress),
            "finalizing" => Some(BatchStatus::Finalizing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelling" => Some(BatchStatus::Cancelling),
            "cancelled" => Some(BatchStatus::Cancelled),
            "expired" => Some(BatchStatus::Expired),
        _ => None,
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled | BatchStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchItemStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchItemStatus::Queued => "queued",
            BatchItemStatus::Running => "running",
            BatchItemStatus::Completed => "completed",
            BatchItemStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<BatchItemStatus> {
        match s {
            "queued" => Some(BatchItemStatus::Queued),
            "running" => Some(BatchItemStatus::Running),
            "completed" => Some(BatchItemStatus::Completed),
            "failed" => Some(BatchItemStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub api_key_id: Uuid,
    pub status: BatchStatus,
    pub endpoint: String,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub completion_window: String,
    pub max_concurrency: i32,
    pub metadata: Option<Value>,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub cancelled: i32,
    pub errors: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelling_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewBatch {
    pub tenant_id: Uuid,
    pub api_key_id: Uuid,
    pub endpoint: String,
    pub input_file_id: String,
    pub completion_window: String,
    pub max_concurrency: i32,
    pub metadata: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BatchItemRow {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub item_index: i32,
    pub status: BatchItemStatus,
    pub custom_id: Option<String>,
    pub input: Value,
    pub response: Option<Value>,
    pub error: Option<Value>,
}

/// Transactional relational store port. Implementations keep every
/// multi-row contract (request+usage insert, batch/item claims) inside a
/// single transaction.
#[async_trait]
pub trait Store: Send + Sync {
    // --- tenants / keys ---
    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKeyRow>>;
    async fn find_api_key(&self, id: Uuid) -> Result<Option<ApiKeyRow>>;
    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRow>>;
    async fn touch_api_key_last_used(&self, id: Uuid, ts: DateTime<Utc>) -> Result<()>;

    // --- budget / guardrails config ---
    async fn tenant_budget(&self, tenant_id: Uuid) -> Result<Option<BudgetRow>>;
    async fn update_budget_alert_state(
        &self,
        tenant_id: Uuid,
        ts: DateTime<Utc>,
        level: &str,
    ) -> Result<()>;
    async fn guardrail_policy(
        &self,
        tenant_id: Uuid,
        api_key_id: Uuid,
    ) -> Result<Option<GuardrailPolicyRow>>;

    // --- catalog / ACL ---
    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>>;
    async fn tenant_models(&self, tenant_id: Uuid) -> Result<Vec<String>>;

    // --- usage / requests ---
    /// One request row unconditionally, one usage row iff present, atomically.
    async fn insert_request(
        &self,
        request: NewRequestRecord,
        usage: Option<NewUsageRecord>,
    ) -> Result<()>;
    async fn find_request_by_idempotency(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<RequestRow>>;
    async fn sum_usage_cents(
        &self,
        tenant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;

    // --- audit ---
    async fn insert_alert_event(&self, event: NewAlertEvent) -> Result<()>;
    async fn insert_guardrail_event(&self, event: NewGuardrailEvent) -> Result<()>;

    // --- batches ---
    async fn create_batch(
        &self,
        batch: NewBatch,
        items: Vec<(Option<String>, Value)>,
        now: DateTime<Utc>,
    ) -> Result<BatchRow>;
    async fn get_batch(&self, tenant_id: Option<Uuid>, id: Uuid) -> Result<Option<BatchRow>>;
    async fn list_batches(
        &self,
        tenant_id: Uuid,
        limit: usize,
        after: Option<Uuid>,
    ) -> Result<(Vec<BatchRow>, bool)>;
    /// Oldest `validating` batch, moved to `in_progress` under SKIP LOCKED.
    async fn claim_next_batch(&self, now: DateTime<Utc>) -> Result<Option<BatchRow>>;
    async fn batch_status(&self, id: Uuid) -> Result<Option<BatchStatus>>;
    /// Next `queued` item of the batch, moved to `running` under SKIP LOCKED.
    /// Returns None while `running` items sit at the batch's
    /// `max_concurrency` ceiling, so a worker pool cannot over-claim one
    /// batch.
    async fn claim_next_item(&self, batch_id: Uuid) -> Result<Option<BatchItemRow>>;
    async fn complete_item(&self, id: Uuid, response: Value) -> Result<()>;
    async fn fail_item(&self, id: Uuid, error: Value) -> Result<()>;
    async fn count_items(&self, batch_id: Uuid, status: BatchItemStatus) -> Result<i64>;
    async fn increment_counts(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        cancelled: i32,
    ) -> Result<()>;
    async fn set_batch_finalizing(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;
    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        output_file_id: Option<String>,
        error_file_id: Option<String>,
        errors: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// Moves a non-terminal batch to `cancelling`; returns the updated row.
    async fn cancel_batch(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRow>>;
}
