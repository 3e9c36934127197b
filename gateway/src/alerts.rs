use crate::budget::BudgetStatus;
use crate::context::RequestContext;
use crate::store::{NewAlertEvent, Store};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    None,
    Warning,
    Exceeded,
    Guardrail,
}

impl AlertLevel {
    pub fn severity(&self) -> u8 {
        match self {
            AlertLevel::None => 0,
            AlertLevel::Warning => 1,
            AlertLevel::Exceeded => 2,
            AlertLevel::Guardrail => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Warning => "warning",
            AlertLevel::Exceeded => "exceeded",
            AlertLevel::Guardrail => "guardrail",
        }
    }

    pub fn from_str(s: &str) -> Option<AlertLevel> {
        match s {
            "none" => Some(AlertLevel::None),
            "warning" => Some(AlertLevel::Warning),
            "exceeded" => Some(AlertLevel::Exceeded),
            "guardrail" => Some(AlertLevel::Guardrail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertMessage {
    pub tenant_id: Uuid,
    pub level: AlertLevel,
    pub subject: String,
    pub body: String,
    pub payload: Value,
    pub emails: Vec<String>,
    pub webhooks: Vec<String>,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn notify(&self, message: &AlertMessage) -> Result<()>;
}

// ---------------- log sink (always present) ----------------

pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, message: &AlertMessage) -> Result<()> {
        warn!(
            tenant_id = %message.tenant_id,
            level = message.level.as_str(),
            subject = %message.subject,
            "{}",
            message.body
        );
        Ok(())
    }
}

// ---------------- SMTP sink ----------------

pub struct SmtpSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSink {
    pub fn new(
        host: &str,
        port: u16,
        from: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host)?.port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }
        Ok(Self {
            transport: builder.build(),
            from: from.parse().map_err(|err| anyhow!("invalid SMTP from address: {err}"))?,
        })
    }
}

#[async_trait]
impl AlertSink for SmtpSink {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn notify(&self, message: &AlertMessage) -> Result<()> {
        let mut failures = Vec::new();
        for target in &message.emails {
            let mailbox: Mailbox = match target.parse() {
                Ok(mb) => mb,
                Err(err) => {
                    failures.push(format!("{target}: invalid address ({err})"));
                    continue;
                }
            };
            let email = Message::builder()
                .from(self.from.clone())
                .to(mailbox)
                .subject(message.subject.clone())
                .body(message.body.clone())?;
            if let Err(err) = self.transport.send(email).await {
                failures.push(format!("{target}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("smtp delivery failed: {}", failures.join("; ")))
        }
    }
}

// ---------------- webhook sink ----------------

pub struct WebhookSink {
    client: Client,
    max_retries: u32,
}

impl WebhookSink {
    pub fn new(client: Client, max_retries: u32) -> Self {
        Self { client, max_retries: max_retries.max(1) }
    }

    async fn post_with_retry(&self, url: &str, payload: &Value) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.client.post(url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(anyhow!("webhook returned status {}", resp.status()));
                }
                Err(err) => last_err = Some(err.into()),
            }
            if attempt < self.max_retries {
                sleep(Duration::from_millis(250 * attempt as u64)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("webhook delivery failed")))
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, message: &AlertMessage) -> Result<()> {
        let payload = json!({
            "tenant_id": message.tenant_id,
            "level": message.level.as_str(),
            "subject": message.subject,
            "message": message.body,
            "payload": message.payload,
            "occurred_at": message.ts,
        });
        let mut failures = Vec::new();
        for url in &message.webhooks {
            if url.trim().is_empty() {
                continue;
            }
            if let Err(err) = self.post_with_retry(url, &payload).await {
                failures.push(format!("{url}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("webhook delivery failed: {}", failures.join("; ")))
        }
    }
}

// ---------------- composite fan-out ----------------

/// Notifies every sink; one sink failing never suppresses the others.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn notify(&self, message: &AlertMessage) -> Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(err) = sink.notify(message).await {
                warn!(sink = sink.name(), ?err, "Alert sink delivery failed");
                failures.push(format!("{}: {err}", sink.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }
}

// ---------------- dispatcher ----------------

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    last_sent: DateTime<Utc>,
    severity: u8,
}

/// Content-violation notice handed over by the guardrail engine.
#[derive(Debug, Clone)]
pub struct GuardrailNotice {
    pub stage: String,
    pub action: String,
    pub category: Option<String>,
    pub detail: Value,
}

pub struct AlertDispatcher {
    sinks: CompositeSink,
    store: Arc<dyn Store>,
    budget_cooldowns: Mutex<HashMap<Uuid, CooldownEntry>>,
    guardrail_cooldowns: Mutex<HashMap<Uuid, CooldownEntry>>,
}

impl AlertDispatcher {
    pub fn new(sinks: CompositeSink, store: Arc<dyn Store>) -> Self {
        Self {
            sinks,
            store,
            budget_cooldowns: Mutex::new(HashMap::new()),
            guardrail_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Budget alert fan-out, cooldown-gated per tenant. Returns the level
    /// that was dispatched (`None` when nothing was sent).
    pub async fn dispatch_budget(
        &self,
        rc: &RequestContext,
        status: &BudgetStatus,
        ts: DateTime<Utc>,
    ) -> AlertLevel {
        let level = if status.exceeded {
            AlertLevel::Exceeded
        } else if status.warning {
            AlertLevel::Warning
        } else {
            return AlertLevel::None;
        };
        if rc.budget.alert_emails.is_empty() && rc.budget.alert_webhooks.is_empty() {
            return AlertLevel::None;
        }

        let allowed = self.pass_cooldown(
            &self.budget_cooldowns,
            rc,
            level,
            ts,
            rc.budget.alert_cooldown,
            true,
        );
        if !allowed {
            return AlertLevel::None;
        }

        let message = AlertMessage {
            tenant_id: rc.tenant_id,
            level,
            subject: format!("Budget {} for tenant {}", level.as_str(), rc.tenant_id),
            body: format!(
                "Tenant {} spend is {} of {} cents ({})",
                rc.tenant_id, status.total_cents, status.limit_cents, level.as_str()
            ),
            payload: json!({
                "total_cents": status.total_cents,
                "limit_cents": status.limit_cents,
            }),
            emails: rc.budget.alert_emails.clone(),
            webhooks: rc.budget.alert_webhooks.clone(),
            ts,
        };
        self.deliver(rc, &message, true).await;
        level
    }

    /// Guardrail alert fan-out. Tracked on its own cooldown, independent of
    /// budget alerts.
    pub async fn dispatch_guardrail(&self, rc: &RequestContext, notice: &GuardrailNotice, ts: DateTime<Utc>) {
        if rc.budget.alert_emails.is_empty() && rc.budget.alert_webhooks.is_empty() {
            return;
        }
        let level = AlertLevel::Guardrail;
        let allowed = self.pass_cooldown(
            &self.guardrail_cooldowns,
            rc,
            level,
            ts,
            rc.budget.alert_cooldown,
            false,
        );
        if !allowed {
            return;
        }
        let message = AlertMessage {
            tenant_id: rc.tenant_id,
            level,
            subject: format!("Guardrail {} at {} stage", notice.action, notice.stage),
            body: format!(
                "Tenant {} triggered a guardrail ({}) during the {} stage",
                rc.tenant_id, notice.action, notice.stage
            ),
            payload: json!({
                "stage": notice.stage,
                "action": notice.action,
                "category": notice.category,
                "detail": notice.detail,
            }),
            emails: rc.budget.alert_emails.clone(),
            webhooks: rc.budget.alert_webhooks.clone(),
            ts,
        };
        self.deliver(rc, &message, false).await;
    }

    /// Send iff the cooldown elapsed or the new severity escalates past the
    /// previously sent one. Budget state additionally seeds from the
    /// persisted override row after a restart; guardrail state is
    /// memory-only.
    fn pass_cooldown(
        &self,
        cooldowns: &Mutex<HashMap<Uuid, CooldownEntry>>,
        rc: &RequestContext,
        level: AlertLevel,
        ts: DateTime<Utc>,
        cooldown: Duration,
        seed_from_row: bool,
    ) -> bool {
        let mut guard = cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.get(&rc.tenant_id).copied().or_else(|| {
            if !seed_from_row {
                return None;
            }
            rc.budget.last_alert_at.map(|last_sent| CooldownEntry {
                last_sent,
                severity: rc
                    .budget
                    .last_alert_level
                    .as_deref()
                    .and_then(AlertLevel::from_str)
                    .map(|l| l.severity())
                    .unwrap_or(0),
            })
        });
        let allowed = match entry {
            None => true,
            Some(entry) => {
                let elapsed = ts.signed_duration_since(entry.last_sent);
                elapsed >= chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero())
                    || level.severity() > entry.severity
            }
        };
        if allowed {
            guard.insert(rc.tenant_id, CooldownEntry { last_sent: ts, severity: level.severity() });
        }
        allowed
    }

    async fn deliver(&self, rc: &RequestContext, message: &AlertMessage, persist_state: bool) {
        let result = self.sinks.notify(message).await;
        let success = result.is_ok();
        let error = result.err().map(|e| e.to_string());
        if let Err(err) = self
            .store
            .insert_alert_event(NewAlertEvent {
                tenant_id: message.tenant_id,
                level: message.level.as_str().to_string(),
                channels: self.sinks.channel_names(),
                payload: message.payload.clone(),
                success,
                error,
                ts: message.ts,
            })
            .await
        {
            warn!(?err, tenant_id = %message.tenant_id, "Failed to persist alert event");
        }

        // Cooldown state persists only when the tenant carries an override
        // row; default-config tenants may re-notify once after a restart.
        if persist_state && rc.budget.has_override {
            if let Err(err) = self
                .store
                .update_budget_alert_state(rc.tenant_id, message.ts, message.level.as_str())
                .await
            {
                warn!(?err, tenant_id = %message.tenant_id, "Failed to persist alert cooldown state");
            }
        }
        info!(
            tenant_id = %message.tenant_id,
            level = message.level.as_str(),
            "Dispatched alert"
        );
    }
}
