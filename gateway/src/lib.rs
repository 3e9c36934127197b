pub mod alerts;
pub mod app;
pub mod auth;
pub mod batch;
pub mod budget;
pub mod clock;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod executor;
pub mod files;
pub mod guardrails;
pub mod handlers;
pub mod limits;
pub mod metrics;
pub mod providers;
pub mod router;
pub mod store;
pub mod usage;
pub mod wire;

// Re-export key types for the binary and the integration tests.
pub use crate::app::AppState;
pub use crate::auth::{hash_secret, Authenticator};
pub use crate::batch::BatchWorker;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::GatewayConfig;
pub use crate::context::{ContextBuilder, RequestContext};
pub use crate::counter::{CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use crate::error::{GatewayError, GatewayResult};
pub use crate::executor::Executor;
pub use crate::files::{FileStore, InMemoryFileStore};
pub use crate::limits::{RateLimitConfig, RateLimiter};
pub use crate::metrics::GatewayMetrics;
pub use crate::providers::{CapabilitySource, ProviderRegistry};
pub use crate::router::RouterEngine;
pub use crate::store::{InMemoryStore, PgStore, Store};
pub use crate::usage::UsageRecorder;
pub use uuid::Uuid;
