use crate::context::{ContextBuilder, RequestContext};
use crate::error::{GatewayError, GatewayResult};
use crate::store::{ApiKeyRow, Store};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Hash applied to the secret half of `sk-<prefix>.<secret>`. Only the hash
/// is ever stored.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)
}

/// Splits a bearer token into (prefix, secret).
fn parse_token(token: &str) -> Option<(&str, &str)> {
    let rest = token.strip_prefix("sk-")?;
    let (prefix, secret) = rest.split_once('.')?;
    if prefix.is_empty() || secret.is_empty() {
        return None;
    }
    Some((prefix, secret))
}

pub struct Authenticator {
    store: Arc<dyn Store>,
    builder: ContextBuilder,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, (ApiKeyRow, Instant)>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, builder: ContextBuilder, cache_ttl: Duration) -> Self {
        Self { store, builder, cache_ttl, cache: RwLock::new(HashMap::new()) }
    }

    /// Full ingress authentication: bearer parsing, secret hash comparison,
    /// tenant/key validation and context construction.
    pub async fn authenticate(&self, authorization: Option<&str>) -> GatewayResult<RequestContext> {
        let header = authorization
            .ok_or_else(|| GatewayError::Authentication("missing Authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| GatewayError::Authentication("expected a Bearer token".into()))?;
        let (prefix, secret) = parse_token(token)
            .ok_or_else(|| GatewayError::Authentication("malformed API key".into()))?;

        let key = self
            .lookup(prefix)
            .await?
            .ok_or_else(|| GatewayError::Authentication("unknown API key".into()))?;
        let presented = hash_secret(secret);
        let eq = ConstantTimeEq::ct_eq(presented.as_bytes(), key.secret_hash.as_bytes()).unwrap_u8();
        if eq == 0 {
            return Err(GatewayError::Authentication("invalid API key secret".into()));
        }

        let rc = self.builder.build(&key).await?;

        // Best-effort; never blocks or fails the request.
        let store = self.store.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(err) = store.touch_api_key_last_used(key_id, chrono::Utc::now()).await {
                debug!(?err, %key_id, "Failed to touch api key last_used_at");
            }
        });

        Ok(rc)
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.builder
    }

    /// Cached positive lookups; misses and stale entries fall through to the
    /// store, so revocation takes effect within one cache interval.
    async fn lookup(&self, prefix: &str) -> GatewayResult<Option<ApiKeyRow>> {
        {
            let guard = self.cache.read().await;
            if let Some((key, inserted)) = guard.get(prefix) {
                if inserted.elapsed() < self.cache_ttl {
                    return Ok(Some(key.clone()));
                }
            }
        }
        let fetched = self
            .store
            .find_api_key_by_prefix(prefix)
            .await
            .map_err(GatewayError::Internal)?;
        let mut guard = self.cache.write().await;
        match &fetched {
            Some(key) => {
                guard.insert(prefix.to_string(), (key.clone(), Instant::now()));
            }
            None => {
                guard.remove(prefix);
            }
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_tokens() {
        let (prefix, secret) = parse_token("sk-abc123.s3cr3t").unwrap();
        assert_eq!(prefix, "abc123");
        assert_eq!(secret, "s3cr3t");
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(parse_token("abc123.s3cr3t").is_none());
        assert!(parse_token("sk-abc123").is_none());
        assert!(parse_token("sk-.secret").is_none());
        assert!(parse_token("sk-abc.").is_none());
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(hash_secret("s3cr3t"), hash_secret("s3cr3t"));
        assert_ne!(hash_secret("s3cr3t"), hash_secret("other"));
    }
}
