use crate::counter::CounterStore;
use crate::store::LimitOverride;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

// Window keys live twice the window; inflight keys are TTL-guarded so a
// crashed process cannot pin slots forever.
const WINDOW_KEY_TTL: Duration = Duration::from_secs(120);
const INFLIGHT_KEY_TTL: Duration = Duration::from_secs(600);

/// Effective per-request limits. A zero field disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
    pub parallel_requests: u32,
}

impl RateLimitConfig {
    /// Field-by-field `min(global, tenant, key)` over positive values; an
    /// override can only narrow, never widen, a stricter lower layer.
    pub fn effective(global: RateLimitConfig, tenant: LimitOverride, key: LimitOverride) -> Self {
        fn narrow(base: u32, layers: [Option<i32>; 2]) -> u32 {
            let mut value = base;
            for layer in layers.into_iter().flatten() {
                if layer > 0 {
                    let layer = layer as u32;
                    if value == 0 || layer < value {
                        value = layer;
                    }
                }
            }
            value
        }
        Self {
            requests_per_minute: narrow(
                global.requests_per_minute,
                [tenant.requests_per_minute, key.requests_per_minute],
            ),
            tokens_per_minute: narrow(
                global.tokens_per_minute,
                [tenant.tokens_per_minute, key.tokens_per_minute],
            ),
            parallel_requests: narrow(
                global.parallel_requests,
                [tenant.parallel_requests, key.parallel_requests],
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("{0}")]
    Exceeded(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Fixed-window RPM/TPM counters plus parallel-slot accounting against the
/// remote counter store. No in-process lock is held across store round-trips.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    fn minute_bucket(now: DateTime<Utc>) -> i64 {
        now.timestamp() / 60
    }

    /// RPM check (counted even when rejected, matching fixed-window
    /// semantics), then parallel-slot acquisition for both scopes.
    pub async fn acquire(
        &self,
        key_scope: &str,
        tenant_scope: &str,
        key_cfg: &RateLimitConfig,
        tenant_cfg: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<SlotRelease, LimitError> {
        let bucket = Self::minute_bucket(now);
        for (scope, cfg) in [(key_scope, key_cfg), (tenant_scope, tenant_cfg)] {
            if cfg.requests_per_minute > 0 {
                let key = format!("{scope}:rpm:{bucket}");
                let current = self.store.incr_by(&key, 1, WINDOW_KEY_TTL).await?;
                if current > cfg.requests_per_minute as i64 {
                    return Err(LimitError::Exceeded(format!(
                        "request rate limit of {} per minute exceeded",
                        cfg.requests_per_minute
                    )));
                }
            }
        }

        let mut release = SlotRelease::empty(self.store.clone());
        for (scope, cfg) in [(key_scope, key_cfg), (tenant_scope, tenant_cfg)] {
            if cfg.parallel_requests == 0 {
                continue;
            }
            let key = format!("{scope}:inflight");
            let current = self.store.incr_by(&key, 1, INFLIGHT_KEY_TTL).await?;
            if current > cfg.parallel_requests as i64 {
                // Undo this increment, then everything acquired so far.
                if let Err(err) = self.store.decr(&key).await {
                    warn!(?err, key, "Failed to roll back parallel slot");
                }
                release.release().await;
                return Err(LimitError::Exceeded(format!(
                    "parallel request limit of {} exceeded",
                    cfg.parallel_requests
                )));
            }
            release.slots.push(key);
        }
        Ok(release)
    }

    /// Charge tokens reported by the provider against the TPM window.
    /// A breach is surfaced but not recoverable: the call already happened
    /// and its tokens count against a future window.
    pub async fn token_allowance(
        &self,
        scope: &str,
        tokens: i64,
        cfg: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<(), LimitError> {
        if cfg.tokens_per_minute == 0 || tokens <= 0 {
            return Ok(());
        }
        let key = format!("{scope}:tpm:{}", Self::minute_bucket(now));
        let current = self.store.incr_by(&key, tokens, WINDOW_KEY_TTL).await?;
        if current > cfg.tokens_per_minute as i64 {
            return Err(LimitError::Exceeded(format!(
                "token rate limit of {} per minute exceeded",
                cfg.tokens_per_minute
            )));
        }
        Ok(())
    }
}

/// Handle to the acquired parallel slots. `release` is idempotent, safe from
/// any task, and never decrements a slot it did not acquire.
pub struct SlotRelease {
    store: Arc<dyn CounterStore>,
    slots: Vec<String>,
    released: AtomicBool,
}

impl std::fmt::Debug for SlotRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRelease")
            .field("slots", &self.slots)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotRelease {
    fn empty(store: Arc<dyn CounterStore>) -> Self {
        Self { store, slots: Vec::new(), released: AtomicBool::new(false) }
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for key in &self.slots {
            if let Err(err) = self.store.decr(key).await {
                warn!(?err, key, "Failed to release parallel slot");
            }
        }
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) && !self.slots.is_empty() {
            let store = self.store.clone();
            let slots = std::mem::take(&mut self.slots);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    for key in slots {
                        let _ = store.decr(&key).await;
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::InMemoryCounterStore;

    fn cfg(rpm: u32, tpm: u32, parallel: u32) -> RateLimitConfig {
        RateLimitConfig { requests_per_minute: rpm, tokens_per_minute: tpm, parallel_requests: parallel }
    }

    #[test]
    fn effective_takes_strictest_layer() {
        let global = cfg(600, 1_000_000, 32);
        let tenant = LimitOverride {
            requests_per_minute: Some(100),
            tokens_per_minute: None,
            parallel_requests: Some(64),
        };
        let key = LimitOverride {
            requests_per_minute: Some(200),
            tokens_per_minute: Some(50_000),
            parallel_requests: None,
        };
        let merged = RateLimitConfig::effective(global, tenant, key);
        assert_eq!(merged.requests_per_minute, 100);
        assert_eq!(merged.tokens_per_minute, 50_000);
        // A wider override (64) cannot widen the stricter global (32).
        assert_eq!(merged.parallel_requests, 32);
    }

    #[tokio::test]
    async fn rpm_cap_rejects_second_request() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
        let now = Utc::now();
        let one_rpm = cfg(1, 0, 0);
        let wide = cfg(100, 0, 0);
        let release = limiter.acquire("key:a", "tenant:t", &one_rpm, &wide, now).await.unwrap();
        release.release().await;
        let err = limiter.acquire("key:a", "tenant:t", &one_rpm, &wide, now).await.unwrap_err();
        assert!(matches!(err, LimitError::Exceeded(_)));
    }

    #[tokio::test]
    async fn parallel_slots_return_to_zero_after_release() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::new(store.clone());
        let now = Utc::now();
        let limited = cfg(0, 0, 1);
        let wide = cfg(0, 0, 10);

        let first = limiter.acquire("key:a", "tenant:t", &limited, &wide, now).await.unwrap();
        let err = limiter.acquire("key:a", "tenant:t", &limited, &wide, now).await.unwrap_err();
        assert!(matches!(err, LimitError::Exceeded(_)));
        // The failed acquire must have rolled its tenant slot back too.
        assert_eq!(store.get("tenant:t:inflight").await.unwrap(), Some(1));

        first.release().await;
        first.release().await; // idempotent
        assert_eq!(store.get("key:a:inflight").await.unwrap(), Some(0));
        assert_eq!(store.get("tenant:t:inflight").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn token_allowance_flags_breach_after_charge() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()));
        let now = Utc::now();
        let limited = cfg(0, 100, 0);
        assert!(limiter.token_allowance("key:a", 60, &limited, now).await.is_ok());
        let err = limiter.token_allowance("key:a", 60, &limited, now).await.unwrap_err();
        assert!(matches!(err, LimitError::Exceeded(_)));
    }
}
