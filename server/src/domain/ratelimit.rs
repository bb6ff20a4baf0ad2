//! Sliding-window rate limiting
//!
//! Three scopes share one algorithm: per {principal, action}, per
//! {tenant, topic}, and global. The store runs the check as a single atomic
//! script on its own clock; when the store is unreachable the service fails
//! closed to an in-process window at 10% of the configured limit. Dropping
//! publishes is preferred over unbounded admission when coordination is lost.

use std::sync::Arc;

use dashmap::DashMap;

use super::metrics::GatewayMetrics;
use crate::core::config::RateLimitSettings;
use crate::core::constants::{
    FALLBACK_LIMIT_DIVISOR, FALLBACK_REAP_AFTER_SECS, GLOBAL_RATE_LIMIT, GLOBAL_RATE_LIMIT_KEY,
    TENANT_TOPIC_RATE_LIMIT,
};
use crate::data::store::{RateDecision, StoreKeys, StoreService};
use crate::utils::time::now_secs;

/// In-process sliding window for one limiter key
#[derive(Default)]
struct FallbackWindow {
    /// Admission timestamps in epoch seconds, oldest first
    timestamps: Vec<u64>,
}

/// Rate limit service for one replica
pub struct RateLimitService {
    store: Arc<StoreService>,
    metrics: Arc<GatewayMetrics>,
    window_secs: u64,
    user_action_limit: u32,
    fallback: DashMap<String, FallbackWindow>,
}

impl RateLimitService {
    pub fn new(
        store: Arc<StoreService>,
        metrics: Arc<GatewayMetrics>,
        settings: &RateLimitSettings,
    ) -> Self {
        Self {
            store,
            metrics,
            window_secs: (settings.window_ms / 1000).max(1),
            user_action_limit: settings.max_requests,
            fallback: DashMap::new(),
        }
    }

    /// Per-{principal, action} scope
    pub async fn check_user_action(&self, user_id: &str, action: &str) -> RateDecision {
        let key = StoreKeys::user_action_rate_limit(user_id, action);
        self.check(&key, self.user_action_limit).await
    }

    /// Per-{tenant, topic} scope
    pub async fn check_tenant_topic(&self, tenant: &str, topic: &str) -> RateDecision {
        let key = self.store.keys().topic_rate_limit(tenant, topic);
        self.check(&key, TENANT_TOPIC_RATE_LIMIT).await
    }

    /// Global scope, shared by every replica
    pub async fn check_global(&self) -> RateDecision {
        self.check(GLOBAL_RATE_LIMIT_KEY, GLOBAL_RATE_LIMIT).await
    }

    async fn check(&self, key: &str, limit: u32) -> RateDecision {
        self.metrics.incr_rate_limit_hits();

        let decision = match self.store.rate_limit(key, self.window_secs, limit).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    %key,
                    error = %e,
                    "Rate limit store check failed, using restricted in-process fallback"
                );
                self.fallback_check(key, limit)
            }
        };

        if !decision.allowed {
            self.metrics.incr_rate_limit_blocks();
        }
        decision
    }

    /// Fail-closed fallback: same window, 10% of the configured limit
    fn fallback_check(&self, key: &str, limit: u32) -> RateDecision {
        let fallback_limit = limit / FALLBACK_LIMIT_DIVISOR;
        let now = now_secs();

        let mut entry = self.fallback.entry(key.to_string()).or_default();
        entry.timestamps.retain(|&ts| ts + self.window_secs > now);

        let allowed = (entry.timestamps.len() as u32) < fallback_limit;
        if allowed {
            entry.timestamps.push(now);
        }

        let used = entry.timestamps.len() as u32;
        let reset_at = entry
            .timestamps
            .first()
            .map(|&ts| ts + self.window_secs)
            .unwrap_or(now + self.window_secs);

        RateDecision {
            allowed,
            remaining: fallback_limit.saturating_sub(used),
            reset_at,
            limit: fallback_limit,
        }
    }

    /// Drop fallback entries whose reset time passed more than five minutes
    /// ago. Called from the periodic reaper task.
    pub fn reap_fallback(&self) {
        let now = now_secs();
        let window = self.window_secs;
        let before = self.fallback.len();
        self.fallback.retain(|_, entry| {
            entry
                .timestamps
                .last()
                .is_some_and(|&ts| ts + window + FALLBACK_REAP_AFTER_SECS > now)
        });
        let removed = before - self.fallback.len();
        if removed > 0 {
            tracing::debug!(removed, "Reaped stale rate-limit fallback entries");
        }
    }

    #[cfg(test)]
    fn fallback_len(&self) -> usize {
        self.fallback.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::MemoryStore;

    fn service_with(settings: RateLimitSettings) -> (Arc<MemoryStore>, RateLimitService) {
        let backend = Arc::new(MemoryStore::new());
        let store = Arc::new(StoreService::with_backend(backend.clone(), "rt", 2000));
        let metrics = Arc::new(GatewayMetrics::new());
        let service = RateLimitService::new(store, metrics, &settings);
        (backend, service)
    }

    fn service() -> (Arc<MemoryStore>, RateLimitService) {
        service_with(RateLimitSettings::default())
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let (_, limiter) = service();
        for i in 0..50 {
            let decision = limiter.check_user_action("u1", "publish").await;
            assert!(decision.allowed, "request {i} should be allowed");
        }
    }

    #[tokio::test]
    async fn test_blocks_over_limit() {
        let (_, limiter) = service_with(RateLimitSettings {
            window_ms: 60000,
            max_requests: 5,
        });

        for _ in 0..5 {
            assert!(limiter.check_user_action("u1", "publish").await.allowed);
        }
        let decision = limiter.check_user_action("u1", "publish").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_at <= now_secs() + 60);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (_, limiter) = service_with(RateLimitSettings {
            window_ms: 60000,
            max_requests: 1,
        });

        assert!(limiter.check_user_action("u1", "publish").await.allowed);
        assert!(!limiter.check_user_action("u1", "publish").await.allowed);
        // Different action and different user each get their own window
        assert!(limiter.check_user_action("u1", "subscribe").await.allowed);
        assert!(limiter.check_user_action("u2", "publish").await.allowed);
        // Tenant/topic scope has its own (larger) limit
        assert!(limiter.check_tenant_topic("t1", "doc").await.allowed);
    }

    #[tokio::test]
    async fn test_fail_closed_fallback_admits_ten_percent() {
        let (backend, limiter) = service();
        backend.set_available(false);

        let mut admitted = 0;
        let mut first_denied = None;
        for i in 0..20 {
            let decision = limiter.check_user_action("u1", "publish").await;
            if decision.allowed {
                admitted += 1;
            } else if first_denied.is_none() {
                first_denied = Some((i, decision));
            }
        }

        // 10% of the configured 100
        assert_eq!(admitted, 10);
        let (index, decision) = first_denied.expect("one request should be denied");
        assert_eq!(index, 10);
        assert!(decision.reset_at <= now_secs() + 60);
        assert_eq!(decision.limit, 10);
    }

    #[tokio::test]
    async fn test_fallback_recovers_when_store_returns() {
        let (backend, limiter) = service_with(RateLimitSettings {
            window_ms: 60000,
            max_requests: 10,
        });

        backend.set_available(false);
        assert!(limiter.check_user_action("u1", "publish").await.allowed);
        assert!(!limiter.check_user_action("u1", "publish").await.allowed);

        backend.set_available(true);
        assert!(limiter.check_user_action("u1", "publish").await.allowed);
    }

    #[tokio::test]
    async fn test_global_scope_uses_shared_key() {
        let (backend, limiter) = service();
        assert!(limiter.check_global().await.allowed);
        // The key is unprefixed and identical on every replica
        backend.set_available(false);
        let decision = limiter.check_global().await;
        assert_eq!(decision.limit, GLOBAL_RATE_LIMIT / FALLBACK_LIMIT_DIVISOR);
    }

    #[tokio::test]
    async fn test_reap_fallback_keeps_fresh_entries() {
        let (backend, limiter) = service();
        backend.set_available(false);
        limiter.check_user_action("u1", "publish").await;
        assert_eq!(limiter.fallback_len(), 1);

        // A fresh entry survives the reap
        limiter.reap_fallback();
        assert_eq!(limiter.fallback_len(), 1);
    }
}
