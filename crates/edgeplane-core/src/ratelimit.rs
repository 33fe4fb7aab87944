//! Token-bucket rate limiter (`spec.md` §4.9).
//!
//! Buckets are keyed by `(client_id, endpoint)` and created lazily under a
//! read-mostly lock. `Allow` never blocks — it either has a token or it
//! doesn't. A background eviction pass drops buckets unused for longer than
//! `idle_timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Per-bucket configuration: steady-state refill rate and max burst size.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub rate_per_second: f64,
    pub burst: f64,
}

struct Bucket {
    config: BucketConfig,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            tokens: config.burst,
            last_refill: now,
            last_used: now,
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.config.rate_per_second).min(self.config.burst);
        self.last_refill = now;
        self.last_used = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Resolves a rate-limit bucket configuration for a normalized endpoint.
pub trait EndpointLimits: Send + Sync {
    fn config_for(&self, endpoint: &str) -> BucketConfig;
}

/// The limiter itself: a map of `(client_id, endpoint) -> Bucket` guarded by
/// a single `RwLock`, matching `spec.md` §5's "reader-writer guarded" shared
/// state for this subsystem.
pub struct RateLimiter {
    buckets: RwLock<HashMap<(String, String), Bucket>>,
    limits: Arc<dyn EndpointLimits>,
}

impl RateLimiter {
    pub fn new(limits: Arc<dyn EndpointLimits>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// Returns `true` if the request is allowed, `false` if the bucket for
    /// `(client_id, endpoint)` is out of tokens.
    pub async fn allow(&self, client_id: &str, endpoint: &str) -> bool {
        {
            let mut buckets = self.buckets.write().await;
            if let Some(bucket) = buckets.get_mut(&(client_id.to_owned(), endpoint.to_owned())) {
                return bucket.try_acquire();
            }
        }
        let config = self.limits.config_for(endpoint);
        let mut bucket = Bucket::new(config);
        let allowed = bucket.try_acquire();
        self.buckets
            .write()
            .await
            .insert((client_id.to_owned(), endpoint.to_owned()), bucket);
        allowed
    }

    /// Drops buckets whose last access is older than `idle_timeout`. Run on
    /// a fixed schedule (`spec.md` §4.9: every 5 minutes, evicting anything
    /// idle more than 10 minutes).
    pub async fn evict_idle(&self, idle_timeout: Duration) {
        let now = Instant::now();
        self.buckets
            .write()
            .await
            .retain(|_, bucket| now.duration_since(bucket.last_used) < idle_timeout);
    }

    /// Number of distinct `(client_id, endpoint)` buckets currently tracked.
    pub async fn tracked_bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }
}

/// Derives the normalized `client_id` for a request per `spec.md` §4.9:
/// API-key hash prefix, else admin-key hash prefix, else client IP from
/// `X-Forwarded-For` (first entry), then `X-Real-IP`, then the remote
/// socket address.
pub fn client_id(
    api_key_hash: Option<&str>,
    admin_key_hash: Option<&str>,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote_addr: &str,
) -> String {
    const PREFIX_LEN: usize = 12;
    if let Some(hash) = api_key_hash {
        return hash.chars().take(PREFIX_LEN).collect();
    }
    if let Some(hash) = admin_key_hash {
        return hash.chars().take(PREFIX_LEN).collect();
    }
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_owned();
        }
    }
    if let Some(ip) = real_ip {
        return ip.to_owned();
    }
    remote_addr.to_owned()
}

/// Normalizes a request path into an endpoint bucket family, e.g.
/// `/tenants/abc-123/api-keys` and `/tenants/def-456/api-keys` both
/// collapse to `/tenants/{id}/api-keys` so every tenant shares one bucket
/// class rather than getting its own.
pub fn normalize_endpoint(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.is_empty() {
                segment.to_owned()
            } else if uuid::Uuid::parse_str(segment).is_ok() {
                "{id}".to_owned()
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLimits(BucketConfig);
    impl EndpointLimits for FixedLimits {
        fn config_for(&self, _endpoint: &str) -> BucketConfig {
            self.0
        }
    }

    #[tokio::test]
    async fn exhausts_then_refills() {
        let limiter = RateLimiter::new(Arc::new(FixedLimits(BucketConfig {
            rate_per_second: 1000.0,
            burst: 2.0,
        })));
        assert!(limiter.allow("client", "/foo").await);
        assert!(limiter.allow("client", "/foo").await);
        assert!(!limiter.allow("client", "/foo").await);
    }

    #[test]
    fn normalizes_uuids() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            normalize_endpoint(&format!("/sites/{id}/plans")),
            "/sites/{id}/plans"
        );
    }
}
