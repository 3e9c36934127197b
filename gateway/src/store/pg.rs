use super::*;
use anyhow::{anyhow, Context};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Postgres-backed store. Multi-row contracts run in explicit transactions;
/// batch and item claims take `FOR UPDATE SKIP LOCKED` so concurrent workers
/// never double-claim.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_tenant(row: &PgRow) -> Result<TenantRow> {
    let status: String = row.try_get("status")?;
    Ok(TenantRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: TenantStatus::from_str(&status)
            .ok_or_else(|| anyhow!("unknown tenant status {status}"))?,
        kind: row.try_get("kind")?,
        limits: LimitOverride {
            requests_per_minute: row.try_get("requests_per_minute")?,
            tokens_per_minute: row.try_get("tokens_per_minute")?,
            parallel_requests: row.try_get("parallel_requests")?,
        },
    })
}

fn map_api_key(row: &PgRow) -> Result<ApiKeyRow> {
    Ok(ApiKeyRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        prefix: row.try_get("prefix")?,
        secret_hash: row.try_get("secret_hash")?,
        name: row.try_get("name")?,
        scopes: row.try_get("scopes")?,
        kind: row.try_get("kind")?,
        owner_user_id: row.try_get("owner_user_id")?,
        revoked_at: row.try_get("revoked_at")?,
        last_used_at: row.try_get("last_used_at")?,
        limits: LimitOverride {
            requests_per_minute: row.try_get("requests_per_minute")?,
            tokens_per_minute: row.try_get("tokens_per_minute")?,
            parallel_requests: row.try_get("parallel_requests")?,
        },
    })
}

fn map_catalog(row: &PgRow) -> Result<CatalogEntry> {
    Ok(CatalogEntry {
        id: row.try_get("id")?,
        alias: row.try_get("alias")?,
        provider: row.try_get("provider")?,
        provider_model: row.try_get("provider_model")?,
        context_window: row.try_get("context_window")?,
        max_output_tokens: row.try_get("max_output_tokens")?,
        modalities: row.try_get("modalities")?,
        supports_tools: row.try_get("supports_tools")?,
        price_input: row.try_get("price_input")?,
        price_output: row.try_get("price_output")?,
        currency: row.try_get("currency")?,
        enabled: row.try_get("enabled")?,
        weight: row.try_get("weight")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_batch(row: &PgRow) -> Result<BatchRow> {
    let status: String = row.try_get("status")?;
    Ok(BatchRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        api_key_id: row.try_get("api_key_id")?,
        status: BatchStatus::from_str(&status)
            .ok_or_else(|| anyhow!("unknown batch status {status}"))?,
        endpoint: row.try_get("endpoint")?,
        input_file_id: row.try_get("input_file_id")?,
        output_file_id: row.try_get("output_file_id")?,
        error_file_id: row.try_get("error_file_id")?,
        completion_window: row.try_get("completion_window")?,
        max_concurrency: row.try_get("max_concurrency")?,
        metadata: row.try_get("metadata")?,
        total: row.try_get("total")?,
        completed: row.try_get("completed")?,
        failed: row.try_get("failed")?,
        cancelled: row.try_get("cancelled")?,
        errors: row.try_get("errors")?,
        created_at: row.try_get("created_at")?,
        in_progress_at: row.try_get("in_progress_at")?,
        finalizing_at: row.try_get("finalizing_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
        cancelling_at: row.try_get("cancelling_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        expires_at: row.try_get("expires_at")?,
        expired_at: row.try_get("expired_at")?,
    })
}

fn map_item(row: &PgRow) -> Result<BatchItemRow> {
    let status: String = row.try_get("status")?;
    Ok(BatchItemRow {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        item_index: row.try_get("item_index")?,
        status: BatchItemStatus::from_str(&status)
            .ok_or_else(|| anyhow!("unknown batch item status {status}"))?,
        custom_id: row.try_get("custom_id")?,
        input: row.try_get("input")?,
        response: row.try_get("response")?,
        error: row.try_get("error")?,
    })
}

const BATCH_COLUMNS: &str = "id, tenant_id, api_key_id, status, endpoint, input_file_id, output_file_id, error_file_id, completion_window, max_concurrency, metadata, total, completed, failed, cancelled, errors, created_at, in_progress_at, finalizing_at, completed_at, failed_at, cancelling_at, cancelled_at, expires_at, expired_at";

const ITEM_COLUMNS: &str = "id, batch_id, item_index, status, custom_id, input, response, error";

#[async_trait]
impl Store for PgStore {
    async fn find_api_key_by_prefix(&self, prefix: &str) -> Result<Option<ApiKeyRow>> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, prefix, secret_hash, name, scopes, kind, owner_user_id,
                      revoked_at, last_used_at, requests_per_minute, tokens_per_minute, parallel_requests
               FROM api_keys WHERE prefix = $1"#,
        )
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_api_key).transpose()
    }

    async fn find_api_key(&self, id: Uuid) -> Result<Option<ApiKeyRow>> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, prefix, secret_hash, name, scopes, kind, owner_user_id,
                      revoked_at, last_used_at, requests_per_minute, tokens_per_minute, parallel_requests
               FROM api_keys WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_api_key).transpose()
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<TenantRow>> {
        let row = sqlx::query(
            r#"SELECT id, name, status, kind, requests_per_minute, tokens_per_minute, parallel_requests
               FROM tenants WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_tenant).transpose()
    }

    async fn touch_api_key_last_used(&self, id: Uuid, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn tenant_budget(&self, tenant_id: Uuid) -> Result<Option<BudgetRow>> {
        let row = sqlx::query(
            r#"SELECT tenant_id, limit_cents, warning_threshold, refresh_schedule,
                      alert_emails, alert_webhooks, alert_cooldown_secs, last_alert_at, last_alert_level
               FROM tenant_budgets WHERE tenant_id = $1"#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(BudgetRow {
                tenant_id: row.try_get("tenant_id")?,
                limit_cents: row.try_get("limit_cents")?,
                warning_threshold: row.try_get("warning_threshold")?,
                refresh_schedule: row.try_get("refresh_schedule")?,
                alert_emails: row.try_get("alert_emails")?,
                alert_webhooks: row.try_get("alert_webhooks")?,
                alert_cooldown_secs: row.try_get("alert_cooldown_secs")?,
                last_alert_at: row.try_get("last_alert_at")?,
                last_alert_level: row.try_get("last_alert_level")?,
            })
        })
        .transpose()
    }

    async fn update_budget_alert_state(
        &self,
        tenant_id: Uuid,
        ts: DateTime<Utc>,
        level: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tenant_budgets SET last_alert_at = $2, last_alert_level = $3 WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .bind(ts)
        .bind(level)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn guardrail_policy(
        &self,
        tenant_id: Uuid,
        api_key_id: Uuid,
    ) -> Result<Option<GuardrailPolicyRow>> {
        // Key-level policy wins over the tenant-level one.
        let row = sqlx::query(
            r#"SELECT id, tenant_id, api_key_id, keywords, moderation_url, timeout_ms, enabled
               FROM guardrail_policies
               WHERE tenant_id = $1 AND enabled AND (api_key_id = $2 OR api_key_id IS NULL)
               ORDER BY api_key_id NULLS LAST
               LIMIT 1"#,
        )
        .bind(tenant_id)
        .bind(api_key_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(GuardrailPolicyRow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                api_key_id: row.try_get("api_key_id")?,
                keywords: row.try_get("keywords")?,
                moderation_url: row.try_get("moderation_url")?,
                timeout_ms: row.try_get("timeout_ms")?,
                enabled: row.try_get("enabled")?,
            })
        })
        .transpose()
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let rows = sqlx::query(
            r#"SELECT id, alias, provider, provider_model, context_window, max_output_tokens,
                      modalities, supports_tools, price_input, price_output, currency, enabled,
                      weight, metadata, created_at
               FROM model_catalog ORDER BY created_at"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_catalog).collect()
    }

    async fn tenant_models(&self, tenant_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT alias FROM tenant_models WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| Ok(row.try_get("alias")?)).collect()
    }

    async fn insert_request(
        &self,
        request: NewRequestRecord,
        usage: Option<NewUsageRecord>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin request tx")?;
        sqlx::query(
            r#"INSERT INTO requests (tenant_id, api_key_id, ts, alias, provider, latency_ms, status,
                                     error_code, input_tokens, output_tokens, cost_cents,
                                     cost_usd_micros, idempotency_key, trace_id, response)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(request.tenant_id)
        .bind(request.api_key_id)
        .bind(request.ts)
        .bind(&request.alias)
        .bind(&request.provider)
        .bind(request.latency_ms)
        .bind(request.status)
        .bind(&request.error_code)
        .bind(request.input_tokens)
        .bind(request.output_tokens)
        .bind(request.cost_cents)
        .bind(request.cost_usd_micros)
        .bind(&request.idempotency_key)
        .bind(&request.trace_id)
        .bind(&request.response)
        .execute(&mut *tx)
        .await?;

        if let Some(usage) = usage {
            sqlx::query(
                r#"INSERT INTO usage (tenant_id, api_key_id, ts, alias, provider, input_tokens,
                                      output_tokens, cost_cents, cost_usd_micros)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
            )
            .bind(usage.tenant_id)
            .bind(usage.api_key_id)
            .bind(usage.ts)
            .bind(&usage.alias)
            .bind(&usage.provider)
            .bind(usage.input_tokens)
            .bind(usage.output_tokens)
            .bind(usage.cost_cents)
            .bind(usage.cost_usd_micros)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("commit request tx")?;
        Ok(())
    }

    async fn find_request_by_idempotency(
        &self,
        tenant_id: Uuid,
        key: &str,
    ) -> Result<Option<RequestRow>> {
        let row = sqlx::query(
            r#"SELECT id, tenant_id, status, idempotency_key, response
               FROM requests WHERE tenant_id = $1 AND idempotency_key = $2"#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(RequestRow {
                id: row.try_get("id")?,
                tenant_id: row.try_get("tenant_id")?,
                status: row.try_get("status")?,
                idempotency_key: row.try_get("idempotency_key")?,
                response: row.try_get("response")?,
            })
        })
        .transpose()
    }

    async fn sum_usage_cents(
        &self,
        tenant_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cost_cents), 0)::BIGINT AS total FROM usage WHERE tenant_id = $1 AND ts >= $2 AND ts < $3",
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }

    async fn insert_alert_event(&self, event: NewAlertEvent) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO alert_events (tenant_id, level, channels, payload, success, error, ts)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(event.tenant_id)
        .bind(&event.level)
        .bind(&event.channels)
        .bind(&event.payload)
        .bind(event.success)
        .bind(&event.error)
        .bind(event.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_guardrail_event(&self, event: NewGuardrailEvent) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO guardrail_events (tenant_id, api_key_id, stage, action, category, detail, ts)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(event.tenant_id)
        .bind(event.api_key_id)
        .bind(&event.stage)
        .bind(&event.action)
        .bind(&event.category)
        .bind(&event.detail)
        .bind(event.ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_batch(
        &self,
        batch: NewBatch,
        items: Vec<(Option<String>, Value)>,
        now: DateTime<Utc>,
    ) -> Result<BatchRow> {
        let mut tx = self.pool.begin().await.context("begin batch tx")?;
        let total = items.len() as i32;
        let row = sqlx::query(&format!(
            r#"INSERT INTO batches (tenant_id, api_key_id, status, endpoint, input_file_id,
                                    completion_window, max_concurrency, metadata, total, created_at, expires_at)
               VALUES ($1, $2, 'validating', $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING {BATCH_COLUMNS}"#
        ))
        .bind(batch.tenant_id)
        .bind(batch.api_key_id)
        .bind(&batch.endpoint)
        .bind(&batch.input_file_id)
        .bind(&batch.completion_window)
        .bind(batch.max_concurrency)
        .bind(&batch.metadata)
        .bind(total)
        .bind(now)
        .bind(batch.expires_at)
        .fetch_one(&mut *tx)
        .await?;
        let created = map_batch(&row)?;

        for (index, (custom_id, input)) in items.into_iter().enumerate() {
            sqlx::query(
                r#"INSERT INTO batch_items (batch_id, item_index, status, custom_id, input)
                   VALUES ($1, $2, 'queued', $3, $4)"#,
            )
            .bind(created.id)
            .bind(index as i32)
            .bind(&custom_id)
            .bind(&input)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("commit batch tx")?;
        Ok(created)
    }

    async fn get_batch(&self, tenant_id: Option<Uuid>, id: Uuid) -> Result<Option<BatchRow>> {
        let row = match tenant_id {
            Some(tenant) => {
                sqlx::query(&format!(
                    "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1 AND tenant_id = $2"
                ))
                .bind(id)
                .bind(tenant)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.as_ref().map(map_batch).transpose()
    }

    async fn list_batches(
        &self,
        tenant_id: Uuid,
        limit: usize,
        after: Option<Uuid>,
    ) -> Result<(Vec<BatchRow>, bool)> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query(&format!(
                    r#"SELECT {BATCH_COLUMNS} FROM batches
                       WHERE tenant_id = $1
                         AND created_at > (SELECT created_at FROM batches WHERE id = $2)
                       ORDER BY created_at LIMIT $3"#
                ))
                .bind(tenant_id)
                .bind(cursor)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {BATCH_COLUMNS} FROM batches WHERE tenant_id = $1 ORDER BY created_at LIMIT $2"
                ))
                .bind(tenant_id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        let mut batches: Vec<BatchRow> = rows.iter().map(map_batch).collect::<Result<_>>()?;
        let has_more = batches.len() > limit;
        batches.truncate(limit);
        Ok((batches, has_more))
    }

    async fn claim_next_batch(&self, now: DateTime<Utc>) -> Result<Option<BatchRow>> {
        let mut tx = self.pool.begin().await.context("begin claim tx")?;
        let candidate = sqlx::query(
            r#"SELECT id FROM batches
               WHERE status = 'validating'
               ORDER BY created_at
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: Uuid = candidate.try_get("id")?;
        let row = sqlx::query(&format!(
            r#"UPDATE batches SET status = 'in_progress', in_progress_at = $2
               WHERE id = $1 RETURNING {BATCH_COLUMNS}"#
        ))
        .bind(id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let claimed = map_batch(&row)?;
        tx.commit().await.context("commit claim tx")?;
        Ok(Some(claimed))
    }

    async fn batch_status(&self, id: Uuid) -> Result<Option<BatchStatus>> {
        let row = sqlx::query("SELECT status FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let status: String = row.try_get("status")?;
            BatchStatus::from_str(&status).ok_or_else(|| anyhow!("unknown batch status {status}"))
        })
        .transpose()
    }

    async fn claim_next_item(&self, batch_id: Uuid) -> Result<Option<BatchItemRow>> {
        let mut tx = self.pool.begin().await.context("begin item claim tx")?;
        let ceiling = sqlx::query(
            r#"SELECT b.max_concurrency,
                      (SELECT COUNT(*) FROM batch_items i
                       WHERE i.batch_id = b.id AND i.status = 'running') AS running
               FROM batches b WHERE b.id = $1"#,
        )
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = ceiling {
            let max_concurrency: i32 = row.try_get("max_concurrency")?;
            let running: i64 = row.try_get("running")?;
            if max_concurrency > 0 && running >= max_concurrency as i64 {
                tx.commit().await?;
                return Ok(None);
            }
        }
        let candidate = sqlx::query(
            r#"SELECT id FROM batch_items
               WHERE batch_id = $1 AND status = 'queued'
               ORDER BY item_index
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(candidate) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: Uuid = candidate.try_get("id")?;
        let row = sqlx::query(&format!(
            "UPDATE batch_items SET status = 'running' WHERE id = $1 RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let claimed = map_item(&row)?;
        tx.commit().await.context("commit item claim tx")?;
        Ok(Some(claimed))
    }

    async fn complete_item(&self, id: Uuid, response: Value) -> Result<()> {
        sqlx::query("UPDATE batch_items SET status = 'completed', response = $2 WHERE id = $1")
            .bind(id)
            .bind(&response)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_item(&self, id: Uuid, error: Value) -> Result<()> {
        sqlx::query("UPDATE batch_items SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(&error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_items(&self, batch_id: Uuid, status: BatchItemStatus) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM batch_items WHERE batch_id = $1 AND status = $2",
        )
        .bind(batch_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    async fn increment_counts(
        &self,
        batch_id: Uuid,
        completed: i32,
        failed: i32,
        cancelled: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE batches
               SET completed = completed + $2, failed = failed + $3, cancelled = cancelled + $4
               WHERE id = $1"#,
        )
        .bind(batch_id)
        .bind(completed)
        .bind(failed)
        .bind(cancelled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_batch_finalizing(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET status = 'finalizing', finalizing_at = $2 WHERE id = $1 AND status IN ('in_progress', 'cancelling')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
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
        let timestamp_column = match status {
            BatchStatus::Completed => "completed_at",
            BatchStatus::Failed => "failed_at",
            BatchStatus::Cancelled => "cancelled_at",
            BatchStatus::Expired => "expired_at",
            other => return Err(anyhow!("cannot finalize batch into {}", other.as_str())),
        };
        sqlx::query(&format!(
            r#"UPDATE batches
               SET status = $2, output_file_id = $3, error_file_id = $4, errors = $5, {timestamp_column} = $6
               WHERE id = $1"#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(&output_file_id)
        .bind(&error_file_id)
        .bind(&errors)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_batch(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchRow>> {
        let row = sqlx::query(&format!(
            r#"UPDATE batches SET status = 'cancelling', cancelling_at = $3
               WHERE id = $1 AND tenant_id = $2 AND status IN ('validating', 'in_progress')
               RETURNING {BATCH_COLUMNS}"#
        ))
        .bind(id)
        .bind(tenant_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_batch).transpose()
    }
}
