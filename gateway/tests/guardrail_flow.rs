mod support;

use httpmock::prelude::*;
use model_gateway::error::GatewayError;
use model_gateway::store::{GuardrailPolicyRow, InMemoryStore};
use model_gateway::wire::ChatRequest;
use serde_json::json;
use std::sync::Arc;
use support::*;
use uuid::Uuid;

fn chat_request(content: &str) -> ChatRequest {
    serde_json::from_value(json!({
        "model": "gpt-mini",
        "messages": [{"role": "user", "content": content}],
    }))
    .unwrap()
}

async fn seed_policy(store: &InMemoryStore, tenant_id: Uuid, keywords: Vec<String>, url: Option<String>) {
    store
        .insert_guardrail_policy(GuardrailPolicyRow {
            id: Uuid::new_v4(),
            tenant_id,
            api_key_id: None,
            keywords,
            moderation_url: url,
            timeout_ms: 2000,
            enabled: true,
        })
        .await;
}

#[tokio::test]
async fn keyword_block_rejects_prompt_before_provider() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;
    seed_policy(&store, seeded.tenant_id, vec!["forbidden".into()], None).await;

    let ok = OkChat::new("unused", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;
    let rc = h.state.authenticator.authenticate(Some(&seeded.bearer)).await.unwrap();

    let err = h
        .state
        .executor
        .chat(&rc, "gpt-mini", &chat_request("this is Forbidden content"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Authorization { code: "guardrail_violation", .. }));
    assert_eq!(err.status(), 403);
    assert_eq!(ok.call_count(), 0);

    let events = store.guardrail_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].stage, "prompt");
    assert_eq!(events[0].action, "block");

    // The blocked attempt still leaves exactly one request row and no usage.
    let requests = store.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].provider, "guardrail");
    assert_eq!(requests[0].status, 403);
    assert_eq!(requests[0].error_code.as_deref(), Some("guardrail_violation"));
    assert!(store.usage_rows().await.is_empty());
}

#[tokio::test]
async fn moderation_webhook_block_fails_request() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let server = MockServer::start_async().await;
    let moderation = server
        .mock_async(|when, then| {
            when.method(POST).path("/moderate");
            then.status(200)
                .json_body(json!({"action": "block", "category": "violence"}));
        })
        .await;
    seed_policy(&store, seeded.tenant_id, vec![], Some(server.url("/moderate"))).await;

    let ok = OkChat::new("unused", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;
    let rc = h.state.authenticator.authenticate(Some(&seeded.bearer)).await.unwrap();

    let err = h
        .state
        .executor
        .chat(&rc, "gpt-mini", &chat_request("borderline content"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Authorization { code: "guardrail_violation", .. }));
    moderation.assert_async().await;
    assert_eq!(ok.call_count(), 0);

    let events = store.guardrail_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category.as_deref(), Some("violence"));

    let requests = store.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].provider, "guardrail");
    assert_eq!(requests[0].status, 403);
}

#[tokio::test]
async fn moderation_warn_records_but_allows() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/moderate");
            then.status(200).json_body(json!({"action": "warn"}));
        })
        .await;
    seed_policy(&store, seeded.tenant_id, vec![], Some(server.url("/moderate"))).await;

    let ok = OkChat::new("fine answer", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;
    let rc = h.state.authenticator.authenticate(Some(&seeded.bearer)).await.unwrap();

    let outcome = h
        .state
        .executor
        .chat(&rc, "gpt-mini", &chat_request("borderline content"), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.payload["choices"][0]["message"]["content"], "fine answer");
    assert_eq!(ok.call_count(), 1);

    // Both the prompt and the response stage passed through the webhook;
    // each non-allow decision left an audit row without failing the call.
    let events = store.guardrail_events().await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.action == "warn"));
}

#[tokio::test]
async fn unreachable_moderation_fails_open() {
    let store = Arc::new(InMemoryStore::new());
    let seeded = seed_tenant_and_key(&store).await;
    store.insert_catalog_entry(catalog_entry("gpt-mini", "p1", "m1", 100)).await;
    seed_policy(
        &store,
        seeded.tenant_id,
        vec![],
        Some("http://127.0.0.1:1/unreachable".into()),
    )
    .await;

    let ok = OkChat::new("served anyway", 10, 5);
    let h = harness(store.clone(), ScriptedSource::default().with_chat("p1", ok.clone())).await;
    let rc = h.state.authenticator.authenticate(Some(&seeded.bearer)).await.unwrap();

    let outcome = h
        .state
        .executor
        .chat(&rc, "gpt-mini", &chat_request("anything"), None, None)
        .await
        .unwrap();
    assert_eq!(outcome.payload["choices"][0]["message"]["content"], "served anyway");
}
