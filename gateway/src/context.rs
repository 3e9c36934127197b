use crate::budget::{BudgetSettings, RefreshSchedule};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::guardrails::GuardrailPolicy;
use crate::limits::RateLimitConfig;
use crate::store::{ApiKeyRow, Store, TenantStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Immutable per-request bundle, constructed at ingress or at batch claim.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub api_key_id: Uuid,
    pub api_key_prefix: String,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetSettings,
    pub guardrails: Option<GuardrailPolicy>,
    /// None means the tenant inherits the full enabled catalog.
    pub allowed_models: Option<HashSet<String>>,
}

impl RequestContext {
    pub fn allows_model(&self, alias: &str) -> bool {
        match &self.allowed_models {
            Some(allowed) => allowed.contains(alias),
            None => true,
        }
    }

    /// Rate-limit scope for the API key combined with the alias.
    pub fn key_scope(&self, alias: &str) -> String {
        format!("key:{}:{}", self.api_key_id, alias)
    }

    pub fn tenant_scope(&self, alias: &str) -> String {
        format!("tenant:{}:{}", self.tenant_id, alias)
    }
}

pub struct ContextBuilder {
    store: Arc<dyn Store>,
    config: Arc<GatewayConfig>,
}

impl ContextBuilder {
    pub fn new(store: Arc<dyn Store>, config: Arc<GatewayConfig>) -> Self {
        Self { store, config }
    }

    /// Builds the context for an already-looked-up key row, validating the
    /// key and its tenant.
    pub async fn build(&self, key: &ApiKeyRow) -> GatewayResult<RequestContext> {
        if key.revoked() {
            return Err(GatewayError::Authentication("API key has been revoked".into()));
        }
        let tenant = self
            .store
            .find_tenant(key.tenant_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Authentication("unknown tenant".into()))?;
        if tenant.status != TenantStatus::Active {
            return Err(GatewayError::Authentication("tenant is suspended".into()));
        }

        let global = RateLimitConfig {
            requests_per_minute: self.config.default_rpm,
            tokens_per_minute: self.config.default_tpm,
            parallel_requests: self.config.default_parallel,
        };
        let rate_limit = RateLimitConfig::effective(global, tenant.limits, key.limits);

        let budget = match self
            .store
            .tenant_budget(tenant.id)
            .await
            .map_err(GatewayError::Internal)?
        {
            Some(row) => BudgetSettings {
                limit_cents: row.limit_cents,
                warning_threshold: row.warning_threshold,
                schedule: RefreshSchedule::parse(&row.refresh_schedule),
                alert_emails: row.alert_emails,
                alert_webhooks: row.alert_webhooks,
                alert_cooldown: Duration::from_secs(row.alert_cooldown_secs.max(0) as u64),
                last_alert_at: row.last_alert_at,
                last_alert_level: row.last_alert_level,
                has_override: true,
            },
            None => BudgetSettings {
                limit_cents: self.config.default_budget_cents,
                warning_threshold: self.config.default_warning_threshold,
                schedule: RefreshSchedule::parse(&self.config.default_budget_schedule),
                alert_emails: Vec::new(),
                alert_webhooks: Vec::new(),
                alert_cooldown: Duration::from_secs(self.config.alert_cooldown_secs),
                last_alert_at: None,
                last_alert_level: None,
                has_override: false,
            },
        };

        let guardrails = self
            .store
            .guardrail_policy(tenant.id, key.id)
            .await
            .map_err(GatewayError::Internal)?
            .map(|row| GuardrailPolicy {
                keywords: row.keywords,
                moderation_url: row.moderation_url,
                timeout: Duration::from_millis(row.timeout_ms.max(0) as u64),
            });

        let models = self
            .store
            .tenant_models(tenant.id)
            .await
            .map_err(GatewayError::Internal)?;
        let allowed_models = if models.is_empty() {
            None
        } else {
            Some(models.into_iter().collect())
        };

        Ok(RequestContext {
            tenant_id: tenant.id,
            api_key_id: key.id,
            api_key_prefix: key.prefix.clone(),
            rate_limit,
            budget,
            guardrails,
            allowed_models,
        })
    }

    /// Batch path: rebuild a context from a stored api_key id. Revocation or
    /// suspension surfaces as a context error, failing the whole batch.
    pub async fn for_api_key_id(&self, api_key_id: Uuid) -> GatewayResult<RequestContext> {
        let key = self
            .store
            .find_api_key(api_key_id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Context("API key no longer exists".into()))?;
        self.build(&key).await.map_err(|err| match err {
            GatewayError::Authentication(msg) => GatewayError::Context(msg),
            other => other,
        })
    }
}
