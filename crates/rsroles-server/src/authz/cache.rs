//! Per-tenant caches for admin tokens and client ids.
//!
//! Entries expire after a fixed TTL and can be invalidated explicitly, e.g.
//! when the authorization server rejects a cached token.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;

use super::error::{AuthzError, AuthzResult};

const MAX_TENANTS: u64 = 10_000;

/// Admin access token issued for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

/// Values keyed by tenant, with TTL-based expiry.
#[derive(Clone)]
pub struct TenantCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<String, V>,
    ttl: Duration,
}

impl<V> fmt::Debug for TenantCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCache")
            .field("ttl", &self.ttl)
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl<V> TenantCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_TENANTS)
            .time_to_live(ttl)
            .build();
        Self { cache, ttl }
    }

    /// Returns the cached value for `tenant`, running `init` on a miss.
    ///
    /// Concurrent misses for the same tenant share one `init`. Failures are
    /// not cached.
    pub async fn get_or_try_insert<F>(&self, tenant: &str, init: F) -> AuthzResult<V>
    where
        F: Future<Output = AuthzResult<V>>,
    {
        self.cache
            .try_get_with(tenant.to_string(), init)
            .await
            .map_err(|err| AuthzError::clone(&err))
    }

    pub async fn get(&self, tenant: &str) -> Option<V> {
        self.cache.get(tenant).await
    }

    pub async fn invalidate(&self, tenant: &str) {
        self.cache.invalidate(tenant).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_value_is_fetched_once_per_tenant() {
        let cache: TenantCache<String> = TenantCache::new(Duration::from_secs(60));
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert("diku", async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok("client-1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "client-1");
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let cache: TenantCache<String> = TenantCache::new(Duration::from_secs(60));
        cache
            .get_or_try_insert("diku", async { Ok("old".to_string()) })
            .await
            .unwrap();

        cache.invalidate("diku").await;
        let value = cache
            .get_or_try_insert("diku", async { Ok("new".to_string()) })
            .await
            .unwrap();

        assert_eq!(value, "new");
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache: TenantCache<String> = TenantCache::new(Duration::from_secs(60));

        let err = cache
            .get_or_try_insert("diku", async {
                Err(AuthzError::Unavailable {
                    message: "down".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.get("diku").await.is_none());

        let value = cache
            .get_or_try_insert("diku", async { Ok("up".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "up");
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let cache: TenantCache<String> = TenantCache::new(Duration::from_secs(60));
        cache
            .get_or_try_insert("diku", async { Ok("a".to_string()) })
            .await
            .unwrap();

        assert!(cache.get("other").await.is_none());
    }
}
