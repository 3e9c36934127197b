mod support;

use chrono::Duration;
use model_gateway::alerts::{
    AlertDispatcher, AlertLevel, CompositeSink, GuardrailNotice, LogSink,
};
use model_gateway::budget::{BudgetSettings, BudgetStatus, RefreshSchedule};
use model_gateway::context::RequestContext;
use model_gateway::limits::RateLimitConfig;
use model_gateway::store::InMemoryStore;
use serde_json::json;
use std::sync::Arc;
use support::*;
use uuid::Uuid;

fn dispatcher(store: Arc<InMemoryStore>) -> AlertDispatcher {
    AlertDispatcher::new(CompositeSink::new(vec![Arc::new(LogSink)]), store)
}

fn context_with_channels(tenant_id: Uuid, has_override: bool) -> RequestContext {
    RequestContext {
        tenant_id,
        api_key_id: Uuid::new_v4(),
        api_key_prefix: "pfx".into(),
        rate_limit: RateLimitConfig {
            requests_per_minute: 0,
            tokens_per_minute: 0,
            parallel_requests: 0,
        },
        budget: BudgetSettings {
            limit_cents: 1000,
            warning_threshold: 0.8,
            schedule: RefreshSchedule::CalendarMonth,
            alert_emails: vec!["ops@example.com".into()],
            alert_webhooks: vec![],
            alert_cooldown: std::time::Duration::from_secs(3600),
            last_alert_at: None,
            last_alert_level: None,
            has_override,
        },
        guardrails: None,
        allowed_models: None,
    }
}

fn warning() -> BudgetStatus {
    BudgetStatus { total_cents: 850, limit_cents: 1000, warning: true, exceeded: false }
}

fn exceeded() -> BudgetStatus {
    BudgetStatus { total_cents: 1000, limit_cents: 1000, warning: false, exceeded: true }
}

#[tokio::test]
async fn cooldown_suppresses_repeat_alerts() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = dispatcher(store.clone());
    let rc = context_with_channels(Uuid::new_v4(), false);
    let t0 = frozen_now();

    assert_eq!(alerts.dispatch_budget(&rc, &warning(), t0).await, AlertLevel::Warning);
    // Ten minutes later, same level: suppressed.
    let again = alerts
        .dispatch_budget(&rc, &warning(), t0 + Duration::minutes(10))
        .await;
    assert_eq!(again, AlertLevel::None);
    assert_eq!(store.alert_events().await.len(), 1);

    // Past the cooldown, the warning fires again.
    let later = alerts
        .dispatch_budget(&rc, &warning(), t0 + Duration::hours(2))
        .await;
    assert_eq!(later, AlertLevel::Warning);
    assert_eq!(store.alert_events().await.len(), 2);
}

#[tokio::test]
async fn escalation_bypasses_cooldown() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = dispatcher(store.clone());
    let rc = context_with_channels(Uuid::new_v4(), false);
    let t0 = frozen_now();

    assert_eq!(alerts.dispatch_budget(&rc, &warning(), t0).await, AlertLevel::Warning);
    // Exceeded outranks warning; the cooldown does not apply.
    let escalated = alerts
        .dispatch_budget(&rc, &exceeded(), t0 + Duration::minutes(5))
        .await;
    assert_eq!(escalated, AlertLevel::Exceeded);
    // Dropping back to warning inside the window stays suppressed.
    let repeat = alerts
        .dispatch_budget(&rc, &warning(), t0 + Duration::minutes(10))
        .await;
    assert_eq!(repeat, AlertLevel::None);
    assert_eq!(store.alert_events().await.len(), 2);
}

#[tokio::test]
async fn no_channels_means_no_dispatch() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = dispatcher(store.clone());
    let mut rc = context_with_channels(Uuid::new_v4(), false);
    rc.budget.alert_emails.clear();

    let level = alerts.dispatch_budget(&rc, &exceeded(), frozen_now()).await;
    assert_eq!(level, AlertLevel::None);
    assert!(store.alert_events().await.is_empty());
}

#[tokio::test]
async fn override_tenants_persist_cooldown_state() {
    let store = Arc::new(InMemoryStore::new());
    let tenant_id = Uuid::new_v4();
    store.set_tenant_budget(budget_row(tenant_id, 1000)).await;
    let alerts = dispatcher(store.clone());
    let rc = context_with_channels(tenant_id, true);
    let t0 = frozen_now();

    alerts.dispatch_budget(&rc, &exceeded(), t0).await;
    let row = model_gateway::store::Store::tenant_budget(store.as_ref(), tenant_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.last_alert_at, Some(t0));
    assert_eq!(row.last_alert_level.as_deref(), Some("exceeded"));
}

#[tokio::test]
async fn persisted_state_seeds_cooldown_after_restart() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = dispatcher(store.clone());
    let mut rc = context_with_channels(Uuid::new_v4(), true);
    let t0 = frozen_now();
    // Context built from a row that already recorded a send moments ago.
    rc.budget.last_alert_at = Some(t0 - Duration::minutes(5));
    rc.budget.last_alert_level = Some("warning".into());

    let level = alerts.dispatch_budget(&rc, &warning(), t0).await;
    assert_eq!(level, AlertLevel::None);
    assert!(store.alert_events().await.is_empty());
}

#[tokio::test]
async fn guardrail_cooldown_is_independent_of_budget() {
    let store = Arc::new(InMemoryStore::new());
    let alerts = dispatcher(store.clone());
    let rc = context_with_channels(Uuid::new_v4(), false);
    let t0 = frozen_now();

    assert_eq!(alerts.dispatch_budget(&rc, &warning(), t0).await, AlertLevel::Warning);
    // A guardrail alert right after still goes out on its own track.
    alerts
        .dispatch_guardrail(
            &rc,
            &GuardrailNotice {
                stage: "response".into(),
                action: "block".into(),
                category: Some("keyword".into()),
                detail: json!({"matched": "secret"}),
            },
            t0 + Duration::seconds(1),
        )
        .await;
    let events = store.alert_events().await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].level, "guardrail");
}
