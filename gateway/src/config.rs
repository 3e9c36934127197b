use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub database_url: String,
    /// Absent selects the in-memory counter store (single-process deployments).
    pub redis_url: Option<String>,
    pub redis_prefix: String,

    // Global rate-limit defaults; tenant/key overrides narrow these.
    pub default_rpm: u32,
    pub default_tpm: u32,
    pub default_parallel: u32,

    // Global budget defaults applied when a tenant has no override.
    pub default_budget_cents: i64,
    pub default_warning_threshold: f64,
    pub default_budget_schedule: String,
    pub alert_cooldown_secs: u64,
    pub alert_webhook_max_retries: u32,

    pub key_refresh_secs: u64,

    pub batch_workers: usize,
    pub batch_poll_interval: Duration,
    pub batch_error_backoff: Duration,

    pub sync_timeout: Duration,
    pub stream_max_duration: Duration,
    pub stream_idle_timeout: Duration,
    pub provider_timeout: Duration,

    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_from: Option<String>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,

    pub router_health_window: usize,
    pub router_failure_threshold: f64,
    pub router_health_cooldown: Duration,

    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let redis_url = env::var("REDIS_URL").ok();
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let redis_prefix =
            env::var("GATEWAY_COUNTER_PREFIX").unwrap_or_else(|_| "model-gateway".to_string());

        let smtp_host = env::var("SMTP_HOST").ok();
        let smtp_from = env::var("SMTP_FROM").ok();

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            redis_prefix,
            default_rpm: env_parse("GATEWAY_DEFAULT_RPM", 600),
            default_tpm: env_parse("GATEWAY_DEFAULT_TPM", 1_000_000),
            default_parallel: env_parse("GATEWAY_DEFAULT_PARALLEL", 32),
            default_budget_cents: env_parse("GATEWAY_DEFAULT_BUDGET_CENTS", 100_000),
            default_warning_threshold: env_parse("GATEWAY_DEFAULT_WARNING_THRESHOLD", 0.8),
            default_budget_schedule: env::var("GATEWAY_DEFAULT_BUDGET_SCHEDULE")
                .unwrap_or_else(|_| "calendar_month".to_string()),
            alert_cooldown_secs: env_parse("GATEWAY_ALERT_COOLDOWN_SECONDS", 3600u64).max(60),
            alert_webhook_max_retries: env_parse("GATEWAY_ALERT_WEBHOOK_MAX_RETRIES", 3),
            key_refresh_secs: env_parse("KEY_REFRESH_SECONDS", 60u64).max(10),
            batch_workers: env_parse("BATCH_WORKERS", 1usize).max(1),
            batch_poll_interval: Duration::from_secs(env_parse("BATCH_POLL_INTERVAL_SECONDS", 2u64).max(1)),
            batch_error_backoff: Duration::from_secs(env_parse("BATCH_ERROR_BACKOFF_SECONDS", 3u64).max(1)),
            sync_timeout: Duration::from_secs(env_parse("SYNC_TIMEOUT_SECONDS", 120u64)),
            stream_max_duration: Duration::from_secs(env_parse("STREAM_MAX_DURATION_SECONDS", 600u64)),
            stream_idle_timeout: Duration::from_secs(env_parse("STREAM_IDLE_TIMEOUT_SECONDS", 60u64)),
            provider_timeout: Duration::from_secs(env_parse("PROVIDER_TIMEOUT_SECONDS", 120u64)),
            smtp_host,
            smtp_port: env_parse("SMTP_PORT", 587u16),
            smtp_from,
            smtp_username: env::var("SMTP_USERNAME").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            router_health_window: env_parse("ROUTER_HEALTH_WINDOW", 20usize).max(1),
            router_failure_threshold: env_parse("ROUTER_FAILURE_THRESHOLD", 0.5),
            router_health_cooldown: Duration::from_secs(env_parse("ROUTER_HEALTH_COOLDOWN_SECONDS", 30u64)),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            anthropic_base_url: env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
        })
    }

    /// SMTP sink is active only when both a host and a from-address are set.
    pub fn smtp_enabled(&self) -> bool {
        self.smtp_host.is_some() && self.smtp_from.is_some()
    }
}
