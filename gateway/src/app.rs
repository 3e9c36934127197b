use crate::alerts::{AlertDispatcher, AlertSink, CompositeSink, LogSink, SmtpSink, WebhookSink};
use crate::auth::Authenticator;
use crate::budget::BudgetEvaluator;
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::context::ContextBuilder;
use crate::counter::CounterStore;
use crate::executor::Executor;
use crate::files::FileStore;
use crate::guardrails::GuardrailEngine;
use crate::limits::RateLimiter;
use crate::metrics::GatewayMetrics;
use crate::providers::CapabilitySource;
use crate::router::RouterEngine;
use crate::store::Store;
use crate::usage::UsageRecorder;
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Process-wide service container, assembled once at startup and shared by
/// the HTTP layer and the batch workers. Treated as immutable; catalog
/// reloads swap the route table and price table in place.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn Store>,
    pub files: Arc<dyn FileStore>,
    pub authenticator: Arc<Authenticator>,
    pub contexts: Arc<ContextBuilder>,
    pub executor: Arc<Executor>,
    pub router: Arc<RouterEngine>,
    pub usage: Arc<UsageRecorder>,
    pub registry: Arc<dyn CapabilitySource>,
    pub metrics: Arc<GatewayMetrics>,
    pub clock: Arc<dyn Clock>,
    pub http_client: Client,
}

impl AppState {
    pub async fn assemble(
        config: Arc<GatewayConfig>,
        store: Arc<dyn Store>,
        files: Arc<dyn FileStore>,
        counter: Arc<dyn CounterStore>,
        registry: Arc<dyn CapabilitySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<AppState> {
        let http_client = Client::builder()
            .timeout(config.provider_timeout)
            .build()?;

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
        if config.smtp_enabled() {
            let host = config.smtp_host.as_deref().unwrap_or_default();
            let from = config.smtp_from.as_deref().unwrap_or_default();
            match SmtpSink::new(
                host,
                config.smtp_port,
                from,
                config.smtp_username.as_deref(),
                config.smtp_password.as_deref(),
            ) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => warn!(?err, "SMTP sink misconfigured, continuing without it"),
            }
        }
        sinks.push(Arc::new(WebhookSink::new(
            http_client.clone(),
            config.alert_webhook_max_retries,
        )));

        let alerts = Arc::new(AlertDispatcher::new(CompositeSink::new(sinks), store.clone()));
        let guardrails = Arc::new(GuardrailEngine::new(
            http_client.clone(),
            store.clone(),
            alerts.clone(),
        ));
        let router = Arc::new(RouterEngine::new(
            config.router_health_window,
            config.router_failure_threshold,
            config.router_health_cooldown,
        ));
        let usage = Arc::new(UsageRecorder::new(store.clone()));
        let budget = Arc::new(BudgetEvaluator::new(store.clone()));
        let limiter = Arc::new(RateLimiter::new(counter));
        let executor = Arc::new(Executor::new(
            router.clone(),
            budget,
            limiter,
            usage.clone(),
            alerts,
            guardrails,
            store.clone(),
            clock.clone(),
            config.provider_timeout,
        ));
        let contexts = Arc::new(ContextBuilder::new(store.clone(), config.clone()));
        let authenticator = Arc::new(Authenticator::new(
            store.clone(),
            ContextBuilder::new(store.clone(), config.clone()),
            Duration::from_secs(config.key_refresh_secs),
        ));
        let metrics = Arc::new(GatewayMetrics::new()?);

        let state = AppState {
            config,
            store,
            files,
            authenticator,
            contexts,
            executor,
            router,
            usage,
            registry,
            metrics,
            clock,
            http_client,
        };
        state.reload_catalog().await?;
        Ok(state)
    }

    /// Reload routes and prices from the catalog. Called at startup and on
    /// catalog change.
    pub async fn reload_catalog(&self) -> Result<()> {
        let entries = self.store.list_catalog().await?;
        self.router.rebuild(&entries, self.registry.as_ref()).await;
        self.usage.rebuild_prices(&entries);
        Ok(())
    }

    /// Periodic catalog refresh, mirroring route rebuilds into every worker.
    pub fn spawn_catalog_refresh(&self, interval: Duration) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = state.reload_catalog().await {
                    warn!(?err, "Failed to refresh catalog");
                }
            }
        });
    }
}
