use crate::context::RequestContext;
use crate::store::{CatalogEntry, NewRequestRecord, NewUsageRecord, Store};
use anyhow::Result;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use common_cost::{token_cost_usd, usd_to_cents, usd_to_micros, CentLedger};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ModelPrice {
    pub price_input: BigDecimal,
    pub price_output: BigDecimal,
}

/// Per-1000-token prices keyed by (alias, provider, model). Rebuilt on
/// catalog change; lookups take the read lock only.
#[derive(Default)]
pub struct PriceTable {
    inner: RwLock<HashMap<(String, String, String), ModelPrice>>,
}

impl PriceTable {
    pub fn rebuild(&self, entries: &[CatalogEntry]) {
        let mut table = HashMap::new();
        for entry in entries {
            table.insert(
                (entry.alias.clone(), entry.provider.clone(), entry.provider_model.clone()),
                ModelPrice {
                    price_input: entry.price_input.clone(),
                    price_output: entry.price_output.clone(),
                },
            );
        }
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    pub fn lookup(&self, alias: &str, provider: &str, model: &str) -> Option<ModelPrice> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&(alias.to_string(), provider.to_string(), model.to_string()))
            .cloned()
    }
}

/// Outcome of one attempted request, successful or not.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub alias: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub status: i32,
    pub error_code: Option<String>,
    pub latency_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
    /// Serialized response payload; persisted only alongside an
    /// idempotency key so replays can return the identical body.
    pub response: Option<Value>,
    /// Flat per-call override (integer cents), e.g. image pricing from
    /// route metadata. Skips the token-price computation entirely.
    pub cost_override_cents: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistedCost {
    pub cost_cents: i64,
    pub cost_usd_micros: i64,
}

pub struct UsageRecorder {
    store: Arc<dyn Store>,
    prices: PriceTable,
    ledger: CentLedger,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, prices: PriceTable::default(), ledger: CentLedger::new() }
    }

    pub fn rebuild_prices(&self, entries: &[CatalogEntry]) {
        self.prices.rebuild(entries);
    }

    pub fn outstanding_remainder(&self, tenant_id: Uuid) -> BigDecimal {
        self.ledger.outstanding(tenant_id)
    }

    /// Writes the request row (always) and the usage row (success only) in
    /// one transaction. Cost allocation settles through the per-tenant
    /// fractional-cent ledger so integer cents never drift from the exact
    /// decimal total.
    pub async fn persist(
        &self,
        rc: &RequestContext,
        outcome: RequestOutcome,
        ts: DateTime<Utc>,
    ) -> Result<PersistedCost> {
        let (cost_cents, cost_usd_micros) = if !outcome.success {
            (0, 0)
        } else if let Some(override_cents) = outcome.cost_override_cents {
            // 1 cent = 10_000 micro-dollars.
            (override_cents, override_cents * 10_000)
        } else {
            let price = self.prices.lookup(&outcome.alias, &outcome.provider, &outcome.model);
            match price {
                Some(price) => {
                    let usd = token_cost_usd(
                        outcome.input_tokens,
                        outcome.output_tokens,
                        &price.price_input,
                        &price.price_output,
                    );
                    let cents = self.ledger.settle(rc.tenant_id, &usd_to_cents(&usd));
                    (cents, usd_to_micros(&usd))
                }
                None => {
                    warn!(
                        alias = %outcome.alias,
                        provider = %outcome.provider,
                        "No price entry for route, recording zero cost"
                    );
                    (0, 0)
                }
            }
        };

        let usage = if outcome.success {
            Some(NewUsageRecord {
                tenant_id: rc.tenant_id,
                api_key_id: Some(rc.api_key_id),
                ts,
                alias: outcome.alias.clone(),
                provider: outcome.provider.clone(),
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
                cost_cents,
                cost_usd_micros,
            })
        } else {
            None
        };

        self.store
            .insert_request(
                NewRequestRecord {
                    tenant_id: rc.tenant_id,
                    api_key_id: Some(rc.api_key_id),
                    ts,
                    alias: outcome.alias,
                    provider: outcome.provider,
                    latency_ms: outcome.latency_ms,
                    status: outcome.status,
                    error_code: outcome.error_code,
                    input_tokens: outcome.input_tokens,
                    output_tokens: outcome.output_tokens,
                    cost_cents,
                    cost_usd_micros,
                    idempotency_key: outcome.idempotency_key,
                    trace_id: outcome.trace_id,
                    response: outcome.response,
                },
                usage,
            )
            .await?;
        Ok(PersistedCost { cost_cents, cost_usd_micros })
    }
}
