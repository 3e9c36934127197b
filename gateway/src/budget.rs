use crate::context::RequestContext;
use crate::error::{GatewayError, GatewayResult};
use crate::store::Store;
use anyhow::anyhow;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    CalendarMonth,
    Weekly,
    RollingDays(u32),
}

impl RefreshSchedule {
    /// Normalizes `calendar_month` / `weekly` / `rolling_<N>d`; anything
    /// unrecognized falls back to the calendar month.
    pub fn parse(s: &str) -> RefreshSchedule {
        match s {
            "calendar_month" => RefreshSchedule::CalendarMonth,
            "weekly" => RefreshSchedule::Weekly,
            other => {
                if let Some(days) = other
                    .strip_prefix("rolling_")
                    .and_then(|rest| rest.strip_suffix('d'))
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n >= 1)
                {
                    RefreshSchedule::RollingDays(days)
                } else {
                    RefreshSchedule::CalendarMonth
                }
            }
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            RefreshSchedule::CalendarMonth => "calendar_month".to_string(),
            RefreshSchedule::Weekly => "weekly".to_string(),
            RefreshSchedule::RollingDays(n) => format!("rolling_{n}d"),
        }
    }

    /// Half-open window `[start, end)` in UTC containing `now`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            RefreshSchedule::CalendarMonth => {
                let start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                let (next_year, next_month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                let end = Utc
                    .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                (start, end)
            }
            RefreshSchedule::Weekly => {
                let days_into_week = now.weekday().num_days_from_monday() as i64;
                let monday = now.date_naive() - Duration::days(days_into_week);
                let start = Utc
                    .from_utc_datetime(&monday.and_hms_opt(0, 0, 0).unwrap_or_default());
                (start, start + Duration::days(7))
            }
            RefreshSchedule::RollingDays(n) => (now - Duration::days(*n as i64), now),
        }
    }
}

/// Effective budget for a request, resolved at context build time.
#[derive(Debug, Clone)]
pub struct BudgetSettings {
    pub limit_cents: i64,
    pub warning_threshold: f64,
    pub schedule: RefreshSchedule,
    pub alert_emails: Vec<String>,
    pub alert_webhooks: Vec<String>,
    pub alert_cooldown: StdDuration,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub last_alert_level: Option<String>,
    pub has_override: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetStatus {
    pub total_cents: i64,
    pub limit_cents: i64,
    pub warning: bool,
    pub exceeded: bool,
}

pub struct BudgetEvaluator {
    store: Arc<dyn Store>,
}

impl BudgetEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Sums the window's spend and classifies it against the effective limit.
    /// A limit ≤ 0 is a configuration error, not "unlimited".
    pub async fn check(&self, rc: &RequestContext, now: DateTime<Utc>) -> GatewayResult<BudgetStatus> {
        let limit = rc.budget.limit_cents;
        if limit <= 0 {
            return Err(GatewayError::Internal(anyhow!(
                "budget limit must be positive, got {limit} cents for tenant {}",
                rc.tenant_id
            )));
        }
        let (from, to) = rc.budget.schedule.window(now);
        let total = self
            .store
            .sum_usage_cents(rc.tenant_id, from, to)
            .await
            .map_err(GatewayError::Internal)?;

        let exceeded = total >= limit;
        let threshold = rc.budget.warning_threshold.clamp(0.0, 0.99);
        let warning = !exceeded
            && threshold > 0.0
            && (total as f64) >= threshold * (limit as f64);
        Ok(BudgetStatus { total_cents: total, limit_cents: limit, warning, exceeded })
    }
}
