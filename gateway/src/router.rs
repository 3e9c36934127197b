use crate::providers::{Capabilities, CapabilitySource};
use crate::store::CatalogEntry;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A concrete (provider, provider_model) deployment serving an alias.
#[derive(Clone)]
pub struct Route {
    pub alias: String,
    pub provider: String,
    pub model: String,
    pub weight: i32,
    pub created_at: DateTime<Utc>,
    pub price_input: BigDecimal,
    pub price_output: BigDecimal,
    pub metadata: Value,
    pub capabilities: Capabilities,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            alias: self.alias.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
        }
    }

    /// Integer metadata override, e.g. `price_image_cents`.
    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub alias: String,
    pub provider: String,
    pub model: String,
}

/// Rolling window of the last W outcomes. A route degrades when its failure
/// rate crosses the threshold and stays degraded until the cooldown passes.
struct HealthWindow {
    outcomes: VecDeque<bool>,
    degraded_until: Option<Instant>,
}

impl HealthWindow {
    fn new() -> Self {
        Self { outcomes: VecDeque::new(), degraded_until: None }
    }

    fn record(&mut self, ok: bool, window: usize, threshold: f64, cooldown: Duration) {
        if self.outcomes.len() == window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
        if !ok {
            let failures = self.outcomes.iter().filter(|o| !**o).count();
            let rate = failures as f64 / self.outcomes.len() as f64;
            if rate > threshold {
                self.degraded_until = Some(Instant::now() + cooldown);
            }
        }
    }

    fn is_degraded(&mut self) -> bool {
        match self.degraded_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed; give the route a fresh window.
                self.degraded_until = None;
                self.outcomes.clear();
                false
            }
            None => false,
        }
    }
}

fn tie_hash(route: &Route) -> u64 {
    let mut hasher = DefaultHasher::new();
    route.alias.hash(&mut hasher);
    route.provider.hash(&mut hasher);
    route.model.hash(&mut hasher);
    hasher.finish()
}

/// Catalog-derived route table with health-aware weighted ordering.
/// Reads vastly outnumber writes; the table is rebuilt wholesale whenever
/// the catalog or provider credentials change.
pub struct RouterEngine {
    routes: RwLock<HashMap<String, Vec<Arc<Route>>>>,
    health: Mutex<HashMap<RouteKey, HealthWindow>>,
    window: usize,
    threshold: f64,
    cooldown: Duration,
}

impl RouterEngine {
    pub fn new(window: usize, threshold: f64, cooldown: Duration) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            window: window.max(1),
            threshold,
            cooldown,
        }
    }

    /// Rebuild the table from enabled catalog entries. Entries whose
    /// provider has no configured backend are skipped. Health state is
    /// keyed independently and survives rebuilds.
    pub async fn rebuild(&self, entries: &[CatalogEntry], registry: &dyn CapabilitySource) {
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for entry in entries.iter().filter(|e| e.enabled) {
            let Some(capabilities) = registry.capabilities(&entry.provider) else {
                debug!(
                    alias = %entry.alias,
                    provider = %entry.provider,
                    "Skipping catalog entry without a configured backend"
                );
                continue;
            };
            let route = Arc::new(Route {
                alias: entry.alias.clone(),
                provider: entry.provider.clone(),
                model: entry.provider_model.clone(),
                weight: entry.weight,
                created_at: entry.created_at,
                price_input: entry.price_input.clone(),
                price_output: entry.price_output.clone(),
                metadata: entry.metadata.clone(),
                capabilities,
            });
            table.entry(entry.alias.clone()).or_default().push(route);
        }
        let aliases = table.len();
        let mut guard = self.routes.write().await;
        *guard = table;
        info!(aliases, "Rebuilt route table");
    }

    /// Ordered candidates for the alias: healthy partition first, then
    /// degraded; descending weight inside each, equal weights spread by a
    /// deterministic hash of (alias, provider, model).
    pub async fn select_routes(&self, alias: &str) -> Vec<Arc<Route>> {
        let snapshot = {
            let guard = self.routes.read().await;
            guard.get(alias).cloned().unwrap_or_default()
        };
        if snapshot.is_empty() {
            return snapshot;
        }

        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        {
            let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
            for route in snapshot {
                let entry = health.entry(route.key()).or_insert_with(HealthWindow::new);
                if entry.is_degraded() {
                    degraded.push(route);
                } else {
                    healthy.push(route);
                }
            }
        }
        let order = |a: &Arc<Route>, b: &Arc<Route>| {
            b.weight
                .cmp(&a.weight)
                .then_with(|| tie_hash(a).cmp(&tie_hash(b)))
                .then_with(|| a.created_at.cmp(&b.created_at))
        };
        healthy.sort_by(order);
        degraded.sort_by(order);
        healthy.extend(degraded);
        healthy
    }

    pub fn report_success(&self, route: &Route) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health
            .entry(route.key())
            .or_insert_with(HealthWindow::new)
            .record(true, self.window, self.threshold, self.cooldown);
    }

    pub fn report_failure(&self, route: &Route) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health
            .entry(route.key())
            .or_insert_with(HealthWindow::new)
            .record(false, self.window, self.threshold, self.cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Capabilities;
    use serde_json::json;

    fn entry(alias: &str, provider: &str, model: &str, weight: i32, offset_secs: i64) -> CatalogEntry {
        CatalogEntry {
            id: uuid::Uuid::new_v4(),
            alias: alias.to_string(),
            provider: provider.to_string(),
            provider_model: model.to_string(),
            context_window: 128_000,
            max_output_tokens: 4096,
            modalities: vec!["text".to_string()],
            supports_tools: true,
            price_input: BigDecimal::from(1),
            price_output: BigDecimal::from(2),
            currency: "USD".to_string(),
            enabled: true,
            weight,
            metadata: json!({}),
            created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
        }
    }

    fn route_from(entry: &CatalogEntry) -> Route {
        Route {
            alias: entry.alias.clone(),
            provider: entry.provider.clone(),
            model: entry.provider_model.clone(),
            weight: entry.weight,
            created_at: entry.created_at,
            price_input: entry.price_input.clone(),
            price_output: entry.price_output.clone(),
            metadata: entry.metadata.clone(),
            capabilities: Capabilities::default(),
        }
    }

    async fn engine_with(entries: &[CatalogEntry]) -> RouterEngine {
        let engine = RouterEngine::new(4, 0.5, Duration::from_millis(50));
        // Insert routes directly; registry wiring is covered elsewhere.
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for e in entries {
            table.entry(e.alias.clone()).or_default().push(Arc::new(route_from(e)));
        }
        *engine.routes.write().await = table;
        engine
    }

    #[tokio::test]
    async fn orders_by_descending_weight() {
        let entries = vec![
            entry("gpt-mini", "openai", "small", 50, 0),
            entry("gpt-mini", "openai", "large", 100, 1),
        ];
        let engine = engine_with(&entries).await;
        let routes = engine.select_routes("gpt-mini").await;
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].model, "large");
        assert_eq!(routes[1].model, "small");
    }

    #[tokio::test]
    async fn degraded_route_sorts_last_until_cooldown() {
        let entries = vec![
            entry("gpt-mini", "openai", "primary", 100, 0),
            entry("gpt-mini", "openai", "fallback", 50, 1),
        ];
        let engine = engine_with(&entries).await;
        let primary = engine.select_routes("gpt-mini").await[0].clone();
        // Two failures out of two crosses the 0.5 threshold.
        engine.report_failure(&primary);
        engine.report_failure(&primary);
        let routes = engine.select_routes("gpt-mini").await;
        assert_eq!(routes[0].model, "fallback");
        assert_eq!(routes[1].model, "primary");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let routes = engine.select_routes("gpt-mini").await;
        assert_eq!(routes[0].model, "primary");
    }

    #[tokio::test]
    async fn unknown_alias_yields_no_routes() {
        let engine = engine_with(&[]).await;
        assert!(engine.select_routes("nope").await.is_empty());
    }

    #[tokio::test]
    async fn equal_weights_order_deterministically() {
        let entries = vec![
            entry("gpt-mini", "openai", "a", 100, 0),
            entry("gpt-mini", "openai", "b", 100, 1),
        ];
        let engine = engine_with(&entries).await;
        let first = engine.select_routes("gpt-mini").await;
        let second = engine.select_routes("gpt-mini").await;
        let names = |rs: &[Arc<Route>]| rs.iter().map(|r| r.model.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first), names(&second));
    }
}
