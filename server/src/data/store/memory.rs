//! In-memory store backend
//!
//! Single-process emulation of the shared store: streams, counters, hashes,
//! sets, lists, TTLs, pattern pub/sub, and the sliding-window rate limit.
//! Used for development and for the test suite; replicas sharing one
//! `MemoryStore` instance observe the same state, which is how the
//! cross-replica tests run without a live server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::backend::{
    PatternListener, PatternMessage, RateDecision, StoreBackend, StreamEntry,
};
use super::error::StoreError;
use crate::utils::time::now_secs;

/// Pub/sub fan-out capacity; listeners that lag skip messages
const PUBSUB_CAPACITY: usize = 4096;

/// A value with an optional expiry
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, Expiring<String>>,
    hashes: HashMap<String, Expiring<HashMap<String, String>>>,
    sets: HashMap<String, Expiring<Vec<String>>>,
    lists: HashMap<String, Expiring<VecDeque<Vec<u8>>>>,
    streams: HashMap<String, Expiring<VecDeque<StreamEntry>>>,
    /// Sliding-window timestamps (epoch seconds) per rate limit key
    rate_windows: HashMap<String, Vec<u64>>,
}

impl MemoryInner {
    /// Drop any expired entry under `key` across all namespaces
    fn purge(&mut self, key: &str) {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| e.is_expired(now)) {
            self.strings.remove(key);
        }
        if self.hashes.get(key).is_some_and(|e| e.is_expired(now)) {
            self.hashes.remove(key);
        }
        if self.sets.get(key).is_some_and(|e| e.is_expired(now)) {
            self.sets.remove(key);
        }
        if self.lists.get(key).is_some_and(|e| e.is_expired(now)) {
            self.lists.remove(key);
        }
        if self.streams.get(key).is_some_and(|e| e.is_expired(now)) {
            self.streams.remove(key);
        }
    }

    fn set_expiry(&mut self, key: &str, at: Instant) -> bool {
        let mut found = false;
        if let Some(e) = self.strings.get_mut(key) {
            e.expires_at = Some(at);
            found = true;
        }
        if let Some(e) = self.hashes.get_mut(key) {
            e.expires_at = Some(at);
            found = true;
        }
        if let Some(e) = self.sets.get_mut(key) {
            e.expires_at = Some(at);
            found = true;
        }
        if let Some(e) = self.lists.get_mut(key) {
            e.expires_at = Some(at);
            found = true;
        }
        if let Some(e) = self.streams.get_mut(key) {
            e.expires_at = Some(at);
            found = true;
        }
        found
    }

    fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        keys.extend(self.strings.keys().cloned());
        keys.extend(self.hashes.keys().cloned());
        keys.extend(self.sets.keys().cloned());
        keys.extend(self.lists.keys().cloned());
        keys.extend(self.streams.keys().cloned());
        keys
    }
}

/// In-memory store backend
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    pubsub: broadcast::Sender<PatternMessage>,
    /// Monotonic source for stream entry ids
    entry_counter: AtomicU64,
    /// When false every operation fails with `Unavailable` (outage simulation)
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            pubsub,
            entry_counter: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the store link
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store link down".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric prefix of a stream entry id (`{n}-0`); ids compare by number,
/// not lexicographically
fn entry_id_number(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Match a redis-style glob pattern (`*` any run, `?` one char) against a name
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// Listener over the in-process pub/sub channel, filtered by pattern
struct MemoryPatternListener {
    pattern: String,
    rx: broadcast::Receiver<PatternMessage>,
}

#[async_trait]
impl PatternListener for MemoryPatternListener {
    async fn next(&mut self) -> Option<PatternMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if glob_match(&self.pattern, &msg.channel) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Pattern listener lagged, skipping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    // =========================================================================
    // Streams
    // =========================================================================

    async fn stream_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<String, StoreError> {
        self.check_available()?;
        let id = format!("{}-0", self.entry_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let entry = StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        };
        let mut inner = self.inner.lock();
        inner.purge(key);
        inner
            .streams
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(VecDeque::new()))
            .value
            .push_back(entry);
        Ok(id)
    }

    async fn stream_range(&self, key: &str, max: usize) -> Result<Vec<StreamEntry>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner
            .streams
            .get(key)
            .map(|e| e.value.iter().take(max).cloned().collect())
            .unwrap_or_default())
    }

    async fn stream_range_after(
        &self,
        key: &str,
        after_id: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.check_available()?;
        let after = entry_id_number(after_id);
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner
            .streams
            .get(key)
            .map(|e| {
                e.value
                    .iter()
                    .filter(|entry| entry_id_number(&entry.id) > after)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_range_tail(
        &self,
        key: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner
            .streams
            .get(key)
            .map(|e| {
                let skip = e.value.len().saturating_sub(max);
                e.value.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn stream_trim_approx(&self, key: &str, cap: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        if let Some(e) = inner.streams.get_mut(key) {
            while e.value.len() as u64 > cap {
                e.value.pop_front();
            }
        }
        Ok(())
    }

    async fn stream_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.streams.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        // No receivers is fine for fire-and-forget
        let _ = self.pubsub.send(PatternMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn pattern_listener(
        &self,
        pattern: &str,
    ) -> Result<Box<dyn PatternListener>, StoreError> {
        self.check_available()?;
        Ok(Box::new(MemoryPatternListener {
            pattern: pattern.to_string(),
            rx: self.pubsub.subscribe(),
        }))
    }

    // =========================================================================
    // Counters, strings
    // =========================================================================

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let entry = inner
            .strings
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new("0".to_string()));
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| StoreError::Operation(format!("key '{key}' is not an integer")))?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn string_set_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.hashes.get(key).map(|e| e.value.clone()).unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let entry = inner
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(HashMap::new()));
        for (k, v) in fields {
            entry.value.insert((*k).to_string(), v.clone());
        }
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        if let Some(e) = inner.hashes.get_mut(key) {
            e.value.remove(field);
        }
        Ok(())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner
            .hashes
            .get(key)
            .map(|e| e.value.keys().cloned().collect())
            .unwrap_or_default())
    }

    // =========================================================================
    // Sets
    // =========================================================================

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let entry = inner
            .sets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(Vec::new()));
        if !entry.value.iter().any(|m| m == member) {
            entry.value.push(member.to_string());
        }
        Ok(())
    }

    async fn set_rem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        if let Some(e) = inner.sets.get_mut(key) {
            e.value.retain(|m| m != member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.sets.get(key).map(|e| e.value.clone()).unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.sets.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    // =========================================================================
    // Lists
    // =========================================================================

    async fn list_push(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let entry = inner
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(VecDeque::new()));
        entry.value.push_back(value.to_vec());
        Ok(entry.value.len() as u64)
    }

    async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let Some(e) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = e.value.len() as i64;
        let norm = |i: i64| -> i64 {
            if i < 0 { (len + i).max(0) } else { i.min(len) }
        };
        let from = norm(start);
        let to = norm(stop).min(len - 1);
        if len == 0 || from > to {
            return Ok(Vec::new());
        }
        Ok(e.value
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        if let Some(e) = inner.lists.get_mut(key) {
            let len = e.value.len() as i64;
            let norm = |i: i64| -> i64 {
                if i < 0 { (len + i).max(0) } else { i.min(len) }
            };
            let from = norm(start);
            let to = norm(stop).min(len - 1);
            if from > to {
                e.value.clear();
            } else {
                e.value = e
                    .value
                    .iter()
                    .skip(from as usize)
                    .take((to - from + 1) as usize)
                    .cloned()
                    .collect();
            }
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.lists.get(key).map(|e| e.value.len() as u64).unwrap_or(0))
    }

    async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let Some(e) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = e.value.len();
        e.value.retain(|v| v != value);
        Ok((before - e.value.len()) as u64)
    }

    // =========================================================================
    // Keys
    // =========================================================================

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.lists.remove(key);
        inner.streams.remove(key);
        Ok(())
    }

    async fn keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let keys = inner.all_keys();
        for key in &keys {
            inner.purge(key);
        }
        Ok(inner
            .all_keys()
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .collect())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        inner.set_expiry(key, Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    async fn rate_limit(
        &self,
        key: &str,
        window_secs: u64,
        limit: u32,
    ) -> Result<RateDecision, StoreError> {
        self.check_available()?;
        let now = now_secs();
        let mut inner = self.inner.lock();
        let window = inner.rate_windows.entry(key.to_string()).or_default();
        window.retain(|&ts| ts + window_secs > now);

        let count = window.len() as u32;
        let allowed = count < limit;
        if allowed {
            window.push(now);
        }
        let used = window.len() as u32;
        let reset_at = window.first().map(|&ts| ts + window_secs).unwrap_or(now + window_secs);

        Ok(RateDecision {
            allowed,
            remaining: limit.saturating_sub(used),
            reset_at,
            limit,
        })
    }

    // =========================================================================
    // Health
    // =========================================================================

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("rt:pub:*:*", "rt:pub:t1:doc:123"));
        assert!(glob_match("rt:topic:*:meta", "rt:topic:t1:doc:123:meta"));
        assert!(!glob_match("rt:pub:*:*", "rt:stream:t1:doc"));
        assert!(!glob_match("rt:topic:*:meta", "rt:topic:t1:doc:subscribers"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[tokio::test]
    async fn test_incr_starts_at_one() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("rt:seq:t1:doc").await.unwrap(), 1);
        assert_eq!(store.incr("rt:seq:t1:doc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stream_range_after_pages_from_cursor() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for n in 0..5u8 {
            ids.push(
                store
                    .stream_append("s", &[("n", n.to_string())])
                    .await
                    .unwrap(),
            );
        }

        let page = store.stream_range_after("s", &ids[1], 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[3]);

        // Cursor at the newest entry yields an empty page
        assert!(
            store
                .stream_range_after("s", &ids[4], 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_stream_range_tail_returns_newest_in_order() {
        let store = MemoryStore::new();
        for n in 0..5u8 {
            store
                .stream_append("s", &[("n", n.to_string())])
                .await
                .unwrap();
        }

        let tail = store.stream_range_tail("s", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].field("n"), Some("3"));
        assert_eq!(tail[1].field("n"), Some("4"));

        // Asking for more than retained returns everything
        assert_eq!(store.stream_range_tail("s", 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_list_push_range_trim() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.list_push("q", &[i]).await.unwrap();
        }
        assert_eq!(store.list_len("q").await.unwrap(), 5);

        let all = store.list_range("q", 0, -1).await.unwrap();
        assert_eq!(all.len(), 5);

        // Keep the last 3
        store.list_trim("q", 2, -1).await.unwrap();
        let rest = store.list_range("q", 0, -1).await.unwrap();
        assert_eq!(rest, vec![vec![2u8], vec![3u8], vec![4u8]]);
    }

    #[tokio::test]
    async fn test_list_rem_removes_all_occurrences() {
        let store = MemoryStore::new();
        store.list_push("q", b"a").await.unwrap();
        store.list_push("q", b"b").await.unwrap();
        store.list_push("q", b"a").await.unwrap();
        assert_eq!(store.list_rem("q", b"a").await.unwrap(), 2);
        assert_eq!(store.list_len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_drops_entry() {
        let store = MemoryStore::new();
        store.hash_set("h", &[("f", "v".to_string())]).await.unwrap();
        store.expire("h", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_add_is_idempotent() {
        let store = MemoryStore::new();
        store.set_add("s", "m1").await.unwrap();
        store.set_add("s", "m1").await.unwrap();
        assert_eq!(store.set_card("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_closed() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.incr("k").await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_available(true);
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            let d = store.rate_limit("rl", 60, 3).await.unwrap();
            assert!(d.allowed);
        }
        let d = store.rate_limit("rl", 60, 3).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert!(d.reset_at >= now_secs());
    }

    #[tokio::test]
    async fn test_pattern_listener_receives_matching_only() {
        let store = MemoryStore::new();
        let mut listener = store.pattern_listener("rt:pub:*:*").await.unwrap();

        store.publish("rt:other:t1:doc", b"nope").await.unwrap();
        store.publish("rt:pub:t1:doc", b"yes").await.unwrap();

        let msg = listener.next().await.unwrap();
        assert_eq!(msg.channel, "rt:pub:t1:doc");
        assert_eq!(msg.payload, b"yes");
    }
}
