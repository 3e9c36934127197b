use crate::alerts::{AlertDispatcher, GuardrailNotice};
use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use crate::store::{NewGuardrailEvent, Store};
use crate::wire::ChatChunk;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Effective content policy for a request; the per-API-key policy wins over
/// the tenant policy when both exist (resolved at context build).
#[derive(Debug, Clone)]
pub struct GuardrailPolicy {
    pub keywords: Vec<String>,
    pub moderation_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailStage {
    Prompt,
    Response,
}

impl GuardrailStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailStage::Prompt => "prompt",
            GuardrailStage::Response => "response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailAction {
    Allow,
    Warn,
    Block,
}

impl GuardrailAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailAction::Allow => "allow",
            GuardrailAction::Warn => "warn",
            GuardrailAction::Block => "block",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailDecision {
    pub action: GuardrailAction,
    pub category: Option<String>,
    pub matched: Option<String>,
}

#[derive(Deserialize)]
struct ModerationReply {
    action: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    violations: Option<serde_json::Value>,
}

/// Case-insensitive substring scan; first hit wins.
pub fn keyword_match<'a>(keywords: &'a [String], text: &str) -> Option<&'a str> {
    let lowered = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .find(|k| lowered.contains(&k.to_lowercase()))
        .map(|k| k.as_str())
}

pub struct GuardrailEngine {
    client: Client,
    store: Arc<dyn Store>,
    alerts: Arc<AlertDispatcher>,
}

impl GuardrailEngine {
    pub fn new(client: Client, store: Arc<dyn Store>, alerts: Arc<AlertDispatcher>) -> Self {
        Self { client, store, alerts }
    }

    /// Stage inspection: keyword blocklist first, then the moderation
    /// webhook. Non-allow decisions are recorded and alerted; `block` fails
    /// the request.
    pub async fn inspect(
        &self,
        rc: &RequestContext,
        stage: GuardrailStage,
        text: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let Some(policy) = &rc.guardrails else {
            return Ok(());
        };
        let decision = self.evaluate(policy, stage, text).await;
        match decision.action {
            GuardrailAction::Allow => Ok(()),
            GuardrailAction::Warn => {
                self.record(rc, stage, &decision, now).await;
                Ok(())
            }
            GuardrailAction::Block => {
                self.record(rc, stage, &decision, now).await;
                Err(GatewayError::Authorization {
                    code: "guardrail_violation",
                    message: "content blocked by guardrail policy".into(),
                })
            }
        }
    }

    async fn evaluate(
        &self,
        policy: &GuardrailPolicy,
        stage: GuardrailStage,
        text: &str,
    ) -> GuardrailDecision {
        if let Some(matched) = keyword_match(&policy.keywords, text) {
            return GuardrailDecision {
                action: GuardrailAction::Block,
                category: Some("keyword".to_string()),
                matched: Some(matched.to_string()),
            };
        }
        if let Some(url) = &policy.moderation_url {
            return self.moderate(url, policy.timeout, stage, text).await;
        }
        GuardrailDecision { action: GuardrailAction::Allow, category: None, matched: None }
    }

    /// Moderation webhook round-trip. Unreachable or malformed moderation
    /// fails open: the gateway keeps serving when the moderation endpoint
    /// is down.
    async fn moderate(
        &self,
        url: &str,
        timeout: Duration,
        stage: GuardrailStage,
        text: &str,
    ) -> GuardrailDecision {
        let body = json!({ "stage": stage.as_str(), "content": text });
        let reply = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await;
        let reply = match reply {
            Ok(resp) if resp.status().is_success() => resp.json::<ModerationReply>().await,
            Ok(resp) => {
                warn!(url, status = %resp.status(), "Moderation webhook returned failure status");
                return GuardrailDecision { action: GuardrailAction::Allow, category: None, matched: None };
            }
            Err(err) => {
                warn!(url, ?err, "Moderation webhook unreachable");
                return GuardrailDecision { action: GuardrailAction::Allow, category: None, matched: None };
            }
        };
        match reply {
            Ok(parsed) => {
                let action = match parsed.action.as_str() {
                    "block" => GuardrailAction::Block,
                    "warn" => GuardrailAction::Warn,
                    _ => GuardrailAction::Allow,
                };
                GuardrailDecision {
                    action,
                    category: parsed.category,
                    matched: parsed.violations.map(|v| v.to_string()),
                }
            }
            Err(err) => {
                warn!(url, ?err, "Moderation webhook returned malformed body");
                GuardrailDecision { action: GuardrailAction::Allow, category: None, matched: None }
            }
        }
    }

    async fn record(
        &self,
        rc: &RequestContext,
        stage: GuardrailStage,
        decision: &GuardrailDecision,
        now: DateTime<Utc>,
    ) {
        self.record_violation(
            rc,
            stage,
            decision.action,
            decision.category.clone(),
            json!({ "matched": decision.matched }),
            now,
        )
        .await;
    }

    /// Writes the audit row and fans out the guardrail alert. Also called
    /// directly by the stream monitor path when a chunk trips a keyword.
    pub async fn record_violation(
        &self,
        rc: &RequestContext,
        stage: GuardrailStage,
        action: GuardrailAction,
        category: Option<String>,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        if let Err(err) = self
            .store
            .insert_guardrail_event(NewGuardrailEvent {
                tenant_id: rc.tenant_id,
                api_key_id: Some(rc.api_key_id),
                stage: stage.as_str().to_string(),
                action: action.as_str().to_string(),
                category: category.clone(),
                detail: detail.clone(),
                ts: now,
            })
            .await
        {
            warn!(?err, tenant_id = %rc.tenant_id, "Failed to persist guardrail event");
        }
        self.alerts
            .dispatch_guardrail(
                rc,
                &GuardrailNotice {
                    stage: stage.as_str().to_string(),
                    action: action.as_str().to_string(),
                    category,
                    detail,
                },
                now,
            )
            .await;
    }
}

/// Buffers streamed chat text per choice and reports the first keyword hit.
/// The executor terminates the stream on a hit; usage is still recorded
/// with the blocked status.
pub struct StreamMonitor {
    keywords: Vec<String>,
    buffers: HashMap<u32, String>,
}

impl StreamMonitor {
    pub fn new(policy: Option<&GuardrailPolicy>) -> Self {
        Self {
            keywords: policy.map(|p| p.keywords.clone()).unwrap_or_default(),
            buffers: HashMap::new(),
        }
    }

    /// Feed one chunk; returns the matched keyword on violation.
    pub fn observe(&mut self, chunk: &ChatChunk) -> Option<String> {
        if self.keywords.is_empty() {
            return None;
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                let buffer = self.buffers.entry(choice.index).or_default();
                buffer.push_str(content);
                if let Some(matched) = keyword_match(&self.keywords, buffer) {
                    return Some(matched.to_string());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ChunkChoice, ChunkDelta};
    use serde_json::Map;

    fn chunk(index: u32, content: &str) -> ChatChunk {
        ChatChunk {
            id: "chunk".into(),
            object: "chat.completion.chunk".into(),
            created: 0,
            model: "m".into(),
            choices: vec![ChunkChoice {
                index,
                delta: ChunkDelta { role: None, content: Some(content.into()), extra: Map::new() },
                finish_reason: None,
            }],
            usage: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let keywords = vec!["Forbidden".to_string()];
        assert_eq!(keyword_match(&keywords, "totally forbidden text"), Some("Forbidden"));
        assert_eq!(keyword_match(&keywords, "fine text"), None);
    }

    #[test]
    fn monitor_catches_keyword_split_across_chunks() {
        let policy = GuardrailPolicy {
            keywords: vec!["secret".to_string()],
            moderation_url: None,
            timeout: Duration::from_secs(1),
        };
        let mut monitor = StreamMonitor::new(Some(&policy));
        assert!(monitor.observe(&chunk(0, "this is se")).is_none());
        assert_eq!(monitor.observe(&chunk(0, "cret stuff")), Some("secret".to_string()));
    }

    #[test]
    fn monitor_tracks_choices_independently() {
        let policy = GuardrailPolicy {
            keywords: vec!["bad".to_string()],
            moderation_url: None,
            timeout: Duration::from_secs(1),
        };
        let mut monitor = StreamMonitor::new(Some(&policy));
        assert!(monitor.observe(&chunk(0, "ba")).is_none());
        // A different choice does not complete choice 0's buffer.
        assert!(monitor.observe(&chunk(1, "d")).is_none());
        assert_eq!(monitor.observe(&chunk(0, "d")), Some("bad".to_string()));
    }
}
