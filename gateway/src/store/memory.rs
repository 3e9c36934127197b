use super::*;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory store. Backs the test suite and mirrors the transactional
/// semantics of the Postgres implementation: claims are atomic under the
/// store lock, and request+usage inserts land together or not at all.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, TenantRow>,
    api_keys: Vec<ApiKeyRow>,
    budgets: HashMap<Uuid, BudgetRow>,
    guardrails: Vec<GuardrailPolicyRow>,
    catalog: Vec<CatalogEntry>,
    tenant_models: HashMap<Uuid, Vec<String>>,
    requests: Vec<(Uuid, NewRequestRecord)>,
    usage: Vec<NewUsageRecord>,
    alert_events: Vec<NewAlertEvent>,
    guardrail_events: Vec<NewGuardrailEvent>,
    batches: Vec<BatchRow>,
    items: Vec<BatchItemRow>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- seeding helpers (admin surface lives outside the core) ---

    pub async fn insert_tenant(&self, tenant: TenantRow) {
        self.inner.lock().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_api_key(&self, key: ApiKeyRow) {
        self.inner.lock().await.api_keys.push(key);
    }

    pub async fn insert_catalog_entry(&self, entry: CatalogEntry) {
        self.inner.lock().await.catalog.push(entry);
    }

    pub async fn set_tenant_budget(&self, budget: BudgetRow) {
        self.inner.lock().await.budgets.insert(budget.tenant_id, budget);
    }

    pub async fn set_tenant_models(&self, tenant_id: Uuid, aliases: Vec<String>) {
        self.inner.lock().await.tenant_models.insert(tenant_id, aliases);
    }

    pub async fn insert_guardrail_policy(&self, policy: GuardrailPolicyRow) {
        self.inner.lock().await.guardrails.push(policy);
    }

    pub async fn revoke_api_key(&self, id: Uuid, ts: DateTime<Utc>) {
        let mut guard = self.inner.lock().await;
        if let Some(key) = guard.api_keys.iter_mut().find(|k| k.id == id) {
            key.revoked_at = Some(ts);
        }
    }

    pub async fn suspend_tenant(&self, id: Uuid) {
        let mut guard = self.inner.lock().await;
        if let Some(tenant) = guard.tenants.get_mut(&id) {
            tenant.status = TenantStatus::Suspended;
        }
    }

    // --- inspection helpers for tests ---

    pub async fn requests(&self) -> Vec<NewRequestRecord> {
        self.inner.lock().await.requests.iter().map(|(_, r)| r.clone()).collect()
    }

    pub async fn usage_rows(&self) -> Vec<NewUsageRecord> {
        self.inner.lock().await.usage.clone()
    }

    pub async fn alert_events(&self) -> Vec<NewAlertEvent> {
        self.inner.lock().await.alert_events.clone()
    }

    pub async fn guardrail_events(&self) -> Vec<NewGuardrailEvent> {
        self.inner.lock().await.guardrail_events.clone()
    }

    pub async fn items_of(&self, batch_id: Uuid) -> Vec<BatchItemRow> {
        let guard = self.inner.lock().await;
        let mut items: Vec<BatchItemRow> =
            guard.items.iter().filter(|i| i.batch_id == batch_id).cloned().collect();
        items.sort_by_key(|i| i.item_index);
        items
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKeyRow>> {
        let guard = self.inner.lock().await;
        Ok(guard.api_keys.iter().find(|k| k.prefix == prefix).cloned())
    }

    async fn find_api_key(&self, id: Uuid) -> Result<Option<ApiKeyRow>> {
        let guard = self.inner.lock().await;
        Ok(guard.api_keys.iter().find(|k| k.id == id).cloned())
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRow>> {
        let guard = self.inner.lock().await;
        Ok(guard.tenants.get(&id).cloned())
    }

    async fn touch_api_key_last_used(&self, id: Uuid, ts: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(key) = guard.api_keys.iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(ts);
        }
        Ok(())
    }

    async fn tenant_budget(&self, tenant_id: Uuid) -> Result<Option<BudgetRow>> {
        let guard = self.inner.lock().await;
        Ok(guard.budgets.get(&tenant_id).cloned())
    }

    async fn update_budget_alert_state(
        &self,
        tenant_id: Uuid,
        ts: DateTime<Utc>,
        level: &str,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(budget) = guard.budgets.get_mut(&tenant_id) {
            budget.last_alert_at = Some(ts);
            budget.last_alert_level = Some(level.to_string());
        }
        Ok(())
    }

    async fn guardrail_policy(
        &self,
        tenant_id: Uuid,
        api_key_id: Uuid,
    ) -> Result<Option<GuardrailPolicyRow>> {
        let guard = self.inner.lock().await;
        let key_level = guard
            .guardrails
            .iter()
            .find(|p| p.enabled && p.tenant_id == tenant_id && p.api_key_id == Some(api_key_id));
        let tenant_level = guard
            .guardrails
            .iter()
            .find(|p| p.enabled && p.tenant_id == tenant_id && p.api_key_id.is_none());
        Ok(key_level.or(tenant_level).cloned())
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.inner.lock().await.catalog.clone())
    }

    async fn tenant_models(&self, tenant_id: Uuid) -> Result<Vec<String>> {
        let guard = self.inner.lock().await;
        Ok(guard.tenant_models.get(&tenant_id).cloned().unwrap_or_default())
    }

    async fn insert_request(
        &self,
        request: NewRequestRecord,
        usage: Option<NewUsageRecord>,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(key) = &request.idempotency_key {
            let duplicate = guard
                .requests
                .iter()
                .any(|(_, r)| r.tenant_id == request.tenant_id && r.idempotency_key.as_ref() == Some(key));
            if duplicate {
                anyhow::bail!("duplicate idempotency key for tenant");
            }
        }
        guard.requests.push((Uuid::new_v4(), request));
        if let Some(usage) = usage {
            guard.usage.push(usage);
        }
        Ok(())
    }

    async fn find_request_by_idempotency(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<RequestRow>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .requests
            .iter()
            .find(|(_, r)| r.tenant_id == tenant_id && r.idempotency_key.as_deref() == Some(key))
            .map(|(id, r)| RequestRow {
                id: *id,
                tenant_id: r.tenant_id,
                status: r.status,
                idempotency_key: r.idempotency_key.clone(),
                response: r.response.clone(),
            }))
    }

    async fn sum_usage_cents(
        &self,
        tenant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let guard = self.inner.lock().await;
        Ok(guard
            .usage
            .iter()
            .filter(|u| u.tenant_id == tenant_id && u.ts >= from && u.ts < to)
            .map(|u| u.cost_cents)
            .sum())
    }

    async fn insert_alert_event(&self, event: NewAlertEvent) -> Result<()> {
        self.inner.lock().await.alert_events.push(event);
        Ok(())
    }

    async fn insert_guardrail_event(&self, event: NewGuardrailEvent) -> Result<()> {
        self.inner.lock().await.guardrail_events.push(event);
        Ok(())
    }

    async fn create_batch(
        &self,
        batch: NewBatch,
        items: Vec<(Option<String>, Value)>,
        now: DateTime<Utc>,
    ) -> Result<BatchRow> {
        let mut guard = self.inner.lock().await;
        let row = BatchRow {
            id: Uuid::new_v4(),
            tenant_id: batch.tenant_id,
            api_key_id: batch.api_key_id,
            status: BatchStatus::Validating,
            endpoint: batch.endpoint,
            input_file_id: batch.input_file_id,
            output_file_id: None,
            error_file_id: None,
            completion_window: batch.completion_window,
            max_concurrency: batch.max_concurrency,
            metadata: batch.metadata,
            total: items.len() as i32,
            completed: 0,
            failed: 0,
            cancelled: 0,
            errors: None,
            created_at: now,
            in_progress_at: None,
            finalizing_at: None,
            completed_at: None,
            failed_at: None,
            cancelling_at: None,
            cancelled_at: None,
            expires_at: batch.expires_at,
            expired_at: None,
        };
        for (index, (custom_id, input)) in items.into_iter().enumerate() {
            guard.items.push(BatchItemRow {
                id: Uuid::new_v4(),
                batch_id: row.id,
                item_index: index as i32,
                status: BatchItemStatus::Queued,
                custom_id,
                input,
                response: None,
                error: None,
            });
        }
        guard.batches.push(row.clone());
        Ok(row)
    }

    async fn get_batch(&self, tenant_id: Option<Uuid>, id: Uuid) -> Result<Option<BatchRow>> {
        let guard = self.inner.lock().await;
        Ok(guard
            .batches
            .iter()
            .find(|b| b.id == id && tenant_id.map(|t| b.tenant_id == t).unwrap_or(true))
            .cloned())
    }

    async fn list_batches(
        &self,
        tenant_id: Uuid,
        limit: usize,
        after: Option<Uuid>,
    ) -> Result<(Vec<BatchRow>, bool)> {
        let guard = self.inner.lock().await;
        let start = match after {
            Some(cursor) => guard
                .batches
                .iter()
                .position(|b| b.id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let visible: Vec<BatchRow> = guard.batches[start.min(guard.batches.len())..]
            .iter()
            .filter(|b| b.tenant_id == tenant_id)
            .cloned()
            .collect();
        let has_more = visible.len() > limit;
        Ok((visible.into_iter().take(limit).collect(), has_more))
    }

    async fn claim_next_batch(&self, now: DateTime<Utc>) -> Result<Option<BatchRow>> {
        let mut guard = self.inner.lock().await;
        let candidate = guard
            .batches
            .iter_mut()
            .filter(|b| b.status == BatchStatus::Validating)
            .min_by_key(|b| b.created_at);
        Ok(candidate.map(|batch| {
            batch.status = BatchStatus::InProgress;
            batch.in_progress_at = Some(now);
            batch.clone()
        }))
    }

    async fn batch_status(&self, id: Uuid) -> Result<Option<BatchStatus>> {
        let guard = self.inner.lock().await;
        Ok(guard.batches.iter().find(|b| b.id == id).map(|b| b.status))
    }

    async fn claim_next_item(&self, batch_id: Uuid) -> Result<Option<BatchItemRow>> {
        let mut guard = self.inner.lock().await;
        let max_concurrency = guard
            .batches
            .iter()
            .find(|b| b.id == batch_id)
            .map(|b| b.max_concurrency)
            .unwrap_or(0);
        let running = guard
            .items
            .iter()
            .filter(|i| i.batch_id == batch_id && i.status == BatchItemStatus::Running)
            .count() as i32;
        if max_concurrency > 0 && running >= max_concurrency {
            return Ok(None);
        }
        let candidate = guard
            .items
            .iter_mut()
            .filter(|i| i.batch_id == batch_id && i.status == BatchItemStatus::Queued)
            .min_by_key(|i| i.item_index);
        Ok(candidate.map(|item| {
            item.status = BatchItemStatus::Running;
            item.clone()
        }))
    }

    async fn complete_item(&self, id: Uuid, response: Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(item) = guard.items.iter_mut().find(|i| i.id == id) {
            item.status = BatchItemStatus::Completed;
            item.response = Some(response);
        }
        Ok(())
    }

    async fn fail_item(&self, id: Uuid, error: Value) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(item) = guard.items.iter_mut().find(|i| i.id == id) {
            item.status = BatchItemStatus::Failed;
            item.error = Some(error);
        }
        Ok(())
    }

    async fn count_items(&self, batch_id: Uuid, status: BatchItemStatus) -> Result<i64> {
        let guard = self.inner.lock().await;
        Ok(guard
            .items
            .iter()
            .filter(|i| i.batch_id == batch_id && i.status == status)
            .count() as i64)
    }

    async fn increment_counts(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        cancelled: i32,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(batch) = guard.batches.iter_mut().find(|b| b.id == batch_id) {
            batch.completed += completed;
            batch.failed += failed;
            batch.cancelled += cancelled;
        }
        Ok(())
    }

    async fn set_batch_finalizing(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(batch) = guard.batches.iter_mut().find(|b| b.id == id) {
            if matches!(batch.status, BatchStatus::InProgress | BatchStatus::Cancelling) {
                batch.status = BatchStatus::Finalizing;
                batch.finalizing_at = Some(now);
            }
        }
        Ok(())
    }

    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        output_file_id: Option<String>,
        error_file_id: Option<String>,
        errors: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !status.terminal() {
            anyhow::bail!("cannot finalize batch into {}", status.as_str());
        }
        let mut guard = self.inner.lock().await;
        if let Some(batch) = guard.batches.iter_mut().find(|b| b.id == id) {
            batch.status = status;
            batch.output_file_id = output_file_id;
            batch.error_file_id = error_file_id;
            batch.errors = errors;
            match status {
                BatchStatus::Completed => batch.completed_at = Some(now),
                BatchStatus::Failed => batch.failed_at = Some(now),
                BatchStatus::Cancelled => batch.cancelled_at = Some(now),
                BatchStatus::Expired => batch.expired_at = Some(now),
                _ => {}
            }
        }
        Ok(())
    }

    async fn cancel_batch(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRow>> {
        let mut guard = self.inner.lock().await;
        let batch = guard
            .batches
            .iter_mut()
            .find(|b| b.id == id && b.tenant_id == tenant_id);
        Ok(batch.and_then(|batch| {
            if matches!(batch.status, BatchStatus::Validating | BatchStatus::InProgress) {
                batch.status = BatchStatus::Cancelling;
                batch.cancelling_at = Some(now);
                Some(batch.clone())
            } else {
                None
            }
        }))
    }
}
