//! Shared store adapter
//!
//! Typed wrapper over the Redis-compatible store with pluggable backends:
//! - In-memory (default) - single-process, for development and tests
//! - Redis (optional) - distributed, for multi-replica deployments
//!
//! `StoreService` layers the cross-cutting policy on top of the backend:
//! - a per-call deadline (deadline exceeded surfaces as `Unavailable`),
//! - a circuit breaker shared by every command connection,
//! - bounded exponential-backoff retry for idempotent commands only
//!   (`incr`, `hash_get_all`, `publish`); everything else fails fast and the
//!   caller decides.

mod backend;
mod circuit;
mod error;
mod key;
mod memory;
mod redis;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use backend::{PatternListener, PatternMessage, RateDecision, StoreBackend, StreamEntry};
pub use circuit::CircuitBreaker;
pub use error::StoreError;
pub use key::StoreKeys;
pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::core::config::{StoreBackendType, StoreConfig};
use crate::core::constants::{
    STORE_RETRY_BASE_DELAY_MS, STORE_RETRY_MAX_ATTEMPTS, STORE_RETRY_MAX_DELAY_MS,
};
use crate::utils::retry::retry_with_backoff;

/// Page size for scans over a retained stream
const STREAM_SCAN_PAGE: usize = 1000;

/// Store service providing the event plane's typed store surface
pub struct StoreService {
    backend: Arc<dyn StoreBackend>,
    keys: StoreKeys,
    breaker: CircuitBreaker,
    deadline: Duration,
}

impl std::fmt::Debug for StoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreService")
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}

impl StoreService {
    /// Create a store service from configuration
    pub async fn new(config: &StoreConfig, prefix: &str) -> Result<Self, StoreError> {
        let backend: Arc<dyn StoreBackend> = match config.backend {
            StoreBackendType::Memory => {
                tracing::debug!("Initializing in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackendType::Redis => {
                let url = config.url.as_ref().ok_or_else(|| {
                    StoreError::Config("store.url required for the redis backend".into())
                })?;
                Arc::new(RedisStore::new(url).await?)
            }
        };

        Ok(Self::with_backend(backend, prefix, config.deadline_ms))
    }

    /// Create from an existing backend (shared across replicas in tests)
    pub fn with_backend(backend: Arc<dyn StoreBackend>, prefix: &str, deadline_ms: u64) -> Self {
        Self {
            backend,
            keys: StoreKeys::new(prefix),
            breaker: CircuitBreaker::new("store"),
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    /// Key builder for the configured namespace
    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Apply the deadline and circuit breaker to one backend call
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        if !self.breaker.allow() {
            return Err(StoreError::Unavailable("circuit open".into()));
        }

        let result = match tokio::time::timeout(self.deadline, fut).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Unavailable("deadline exceeded".into())),
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.is_unavailable() => self.breaker.record_failure(),
            // Operation-level errors mean the link itself is healthy
            Err(_) => self.breaker.record_success(),
        }

        result
    }

    // =========================================================================
    // Streams
    // =========================================================================

    pub async fn stream_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<String, StoreError> {
        self.guarded(self.backend.stream_append(key, fields)).await
    }

    /// Read up to `max` entries in append order
    pub async fn stream_range(&self, key: &str, max: usize) -> Result<Vec<StreamEntry>, StoreError> {
        self.guarded(self.backend.stream_range(key, max)).await
    }

    /// Read up to `max` entries after `after_id` (exclusive), in append order
    pub async fn stream_range_after(
        &self,
        key: &str,
        after_id: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.guarded(self.backend.stream_range_after(key, after_id, max))
            .await
    }

    /// Read the newest `max` entries, returned in append order
    pub async fn stream_range_tail(
        &self,
        key: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.guarded(self.backend.stream_range_tail(key, max)).await
    }

    /// Read up to `max` entries whose `seq` field is at least `min_seq`,
    /// in ascending order. Entries older than the durable tail are simply
    /// absent; callers reconcile via their own state.
    ///
    /// Pages over the whole retained stream so the `max` bound applies to
    /// matching entries, not to an oldest-first window: approximate trimming
    /// can leave the stream larger than any single page, and a recent
    /// `min_seq` must still find its entries past that window.
    pub async fn stream_range_from(
        &self,
        key: &str,
        min_seq: u64,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut matched = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match &cursor {
                None => self.stream_range(key, STREAM_SCAN_PAGE).await?,
                Some(after_id) => {
                    self.stream_range_after(key, after_id, STREAM_SCAN_PAGE)
                        .await?
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id.clone());
            let page_len = page.len();

            for entry in page {
                let seq_matches = entry
                    .field("seq")
                    .and_then(|s| s.parse::<u64>().ok())
                    .is_some_and(|seq| seq >= min_seq);
                if seq_matches {
                    matched.push(entry);
                    if matched.len() >= max {
                        return Ok(matched);
                    }
                }
            }

            if page_len < STREAM_SCAN_PAGE {
                break;
            }
        }

        Ok(matched)
    }

    pub async fn stream_trim_approx(&self, key: &str, cap: u64) -> Result<(), StoreError> {
        self.guarded(self.backend.stream_trim_approx(key, cap)).await
    }

    pub async fn stream_len(&self, key: &str) -> Result<u64, StoreError> {
        self.guarded(self.backend.stream_len(key)).await
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Publish a payload (idempotent for consumers deduplicating by id; retried)
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        retry_with_backoff(
            STORE_RETRY_MAX_ATTEMPTS,
            STORE_RETRY_BASE_DELAY_MS,
            STORE_RETRY_MAX_DELAY_MS,
            StoreError::is_unavailable,
            || self.guarded(self.backend.publish(channel, payload)),
        )
        .await
    }

    /// Open a pattern subscription on a dedicated connection.
    ///
    /// The listener is long-lived; only its setup runs under the deadline.
    pub async fn pattern_listener(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn PatternListener>, StoreError> {
        self.guarded(self.backend.pattern_listener(pattern)).await
    }

    // =========================================================================
    // Counters, strings
    // =========================================================================

    /// Atomic increment (retried; the store linearizes concurrent callers)
    pub async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        retry_with_backoff(
            STORE_RETRY_MAX_ATTEMPTS,
            STORE_RETRY_BASE_DELAY_MS,
            STORE_RETRY_MAX_DELAY_MS,
            StoreError::is_unavailable,
            || self.guarded(self.backend.incr(key)),
        )
        .await
    }

    pub async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.guarded(self.backend.string_get(key)).await
    }

    pub async fn string_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.guarded(self.backend.string_set_ex(key, value, ttl_secs))
            .await
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    /// Read a whole hash (retried)
    pub async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        retry_with_backoff(
            STORE_RETRY_MAX_ATTEMPTS,
            STORE_RETRY_BASE_DELAY_MS,
            STORE_RETRY_MAX_DELAY_MS,
            StoreError::is_unavailable,
            || self.guarded(self.backend.hash_get_all(key)),
        )
        .await
    }

    pub async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.guarded(self.backend.hash_set(key, fields)).await
    }

    pub async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.hash_del(key, field)).await
    }

    pub async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(self.backend.hash_keys(key)).await
    }

    // =========================================================================
    // Sets
    // =========================================================================

    pub async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.set_add(key, member)).await
    }

    pub async fn set_rem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.set_rem(key, member)).await
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(self.backend.set_members(key)).await
    }

    pub async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        self.guarded(self.backend.set_card(key)).await
    }

    // =========================================================================
    // Lists
    // =========================================================================

    pub async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.guarded(self.backend.list_push(key, value)).await
    }

    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.guarded(self.backend.list_range(key, start, stop)).await
    }

    pub async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.guarded(self.backend.list_trim(key, start, stop)).await
    }

    pub async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.guarded(self.backend.list_len(key)).await
    }

    pub async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.guarded(self.backend.list_rem(key, value)).await
    }

    // =========================================================================
    // Keys
    // =========================================================================

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guarded(self.backend.delete(key)).await
    }

    pub async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.guarded(self.backend.keys_by_pattern(pattern)).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.guarded(self.backend.expire(key, ttl_secs)).await
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Atomic sliding-window admission check
    pub async fn rate_limit(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> Result<RateDecision, StoreError> {
        self.guarded(self.backend.rate_limit(key, window_secs, limit))
            .await
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.guarded(self.backend.health_check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (Arc<MemoryStore>, StoreService) {
        let backend = Arc::new(MemoryStore::new());
        let service = StoreService::with_backend(backend.clone(), "rt", 2000);
        (backend, service)
    }

    #[tokio::test]
    async fn test_stream_range_from_filters_by_seq_field() {
        let (_, store) = service();
        for seq in 1..=5u64 {
            store
                .stream_append("s", &[("seq", seq.to_string()), ("type", "op".to_string())])
                .await
                .unwrap();
        }

        let entries = store.stream_range_from("s", 3, 100).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("seq"), Some("3"));
        assert_eq!(entries[2].field("seq"), Some("5"));
    }

    #[tokio::test]
    async fn test_stream_range_from_finds_matches_past_the_first_page() {
        let (_, store) = service();
        // More retained entries than one scan page, as approximate trimming allows
        for seq in 1..=1200u64 {
            store
                .stream_append("s", &[("seq", seq.to_string())])
                .await
                .unwrap();
        }

        let entries = store.stream_range_from("s", 1150, 100).await.unwrap();
        assert_eq!(entries.len(), 51);
        assert_eq!(entries.first().unwrap().field("seq"), Some("1150"));
        assert_eq!(entries.last().unwrap().field("seq"), Some("1200"));
    }

    #[tokio::test]
    async fn test_stream_range_from_bounds_matching_entries_only() {
        let (_, store) = service();
        for seq in 1..=30u64 {
            store
                .stream_append("s", &[("seq", seq.to_string())])
                .await
                .unwrap();
        }

        // The bound applies to matches, oldest first, not to the raw scan
        let entries = store.stream_range_from("s", 5, 10).await.unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries.first().unwrap().field("seq"), Some("5"));
        assert_eq!(entries.last().unwrap().field("seq"), Some("14"));
    }

    #[tokio::test]
    async fn test_unavailable_backend_surfaces_unavailable() {
        let (backend, store) = service();
        backend.set_available(false);
        let err = store.set_card("k").await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_keys_accessor_uses_prefix() {
        let (_, store) = service();
        assert_eq!(store.keys().stream("t", "x"), "rt:stream:t:x");
    }
}
