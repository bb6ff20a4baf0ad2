//! Store backend trait definition
//!
//! Narrow typed surface over the shared store. Two implementations:
//! - In-memory (default) - single-process, for development and tests
//! - Redis (optional) - distributed, for multi-replica deployments
//!
//! Every method fails with `StoreError::Unavailable` when the underlying link
//! is down; callers own the fallback policy.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::StoreError;

/// One entry of a durable stream
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Store-assigned entry id
    pub id: String,
    /// Field/value pairs in append order
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of an atomic sliding-window rate limit check
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix timestamp (seconds) when the window resets
    pub reset_at: u64,
    pub limit: u32,
}

/// A message received through a pattern subscription
#[derive(Debug, Clone)]
pub struct PatternMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Listener half of a pattern subscription.
///
/// `next` returns `None` when the underlying connection is gone; the consumer
/// re-opens the subscription to reconnect.
#[async_trait]
pub trait PatternListener: Send {
    async fn next(&mut self) -> Option<PatternMessage>;
}

/// Shared store backend trait
#[async_trait]
pub trait StoreBackend: Send + Sync {
    // =========================================================================
    // Streams
    // =========================================================================

    /// Append an entry, returning the store-assigned entry id
    async fn stream_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<String, StoreError>;

    /// Read up to `max` entries in append order
    async fn stream_range(&self, key: &str, max: usize) -> Result<Vec<StreamEntry>, StoreError>;

    /// Read up to `max` entries after `after_id` (exclusive), in append
    /// order; the paging cursor for scans over the whole retained stream
    async fn stream_range_after(
        &self,
        key: &str,
        after_id: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Read the newest `max` entries, returned in append order
    async fn stream_range_tail(
        &self,
        key: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Approximately trim the stream to `cap` most recent entries
    async fn stream_trim_approx(&self, key: &str, cap: u64) -> Result<(), StoreError>;

    /// Number of retained entries
    async fn stream_len(&self, key: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    /// Publish a payload to a channel (fire-and-forget)
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError>;

    /// Open a pattern subscription on a dedicated connection
    async fn pattern_listener(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn PatternListener>, StoreError>;

    // =========================================================================
    // Counters, strings
    // =========================================================================

    /// Atomic increment; the counter starts at 1 on first call
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn string_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Hashes
    // =========================================================================

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Sets
    // =========================================================================

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_rem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_card(&self, key: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Lists
    // =========================================================================

    /// Append to the tail; returns the new length
    async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64, StoreError>;

    async fn list_range(&self, key: &str, start: i64, stop: i64)
    -> Result<Vec<Vec<u8>>, StoreError>;

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove every occurrence of `value` from the list
    async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64, StoreError>;

    // =========================================================================
    // Keys
    // =========================================================================

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    // =========================================================================
    // Rate limiting
    // =========================================================================

    /// Atomic sliding-window check: prune entries older than the window, read
    /// cardinality, admit and record if below the limit. Runs as a single
    /// server-side script on the redis backend, on the store's own clock.
    async fn rate_limit(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> Result<RateDecision, StoreError>;

    // =========================================================================
    // Health and metadata
    // =========================================================================

    async fn health_check(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}
