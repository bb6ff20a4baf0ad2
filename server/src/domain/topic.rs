//! Topic state management
//!
//! Sequence allocation, durable append to the bounded per-topic stream,
//! subscriber registry, per-subscriber bounded queues with coalescing, and
//! the inactive-subscriber reaper.
//!
//! ## Append contract
//!
//! The sequence counter and the stream append are not one transaction; the
//! invariant maintained is that every retained stream entry carries its
//! authoritative `seq` field. Consumers that miss a publish recover by
//! ranging over the stream.
//!
//! ## Queues
//!
//! Each subscriber owns one bounded FIFO queue in the store. Overflow trims
//! from the head (oldest first). When a cursor/presence event arrives and the
//! queue is at least 75% full, prior entries from the same `(type, sender)`
//! are removed first; only the newest value of a state-overwrite event is
//! worth delivering to a slow client.

use std::sync::Arc;

use dashmap::DashSet;

use super::envelope::{EventEnvelope, is_coalescible};
use super::error::GatewayError;
use super::metrics::GatewayMetrics;
use crate::core::config::GatewayConfig;
use crate::core::constants::{
    BACKLOG_READ_MAX, COALESCE_OCCUPANCY_PCT, SUBSCRIBER_TTL_SECS, TOPIC_META_TTL_SECS,
};
use crate::data::store::{StoreService, StreamEntry};
use crate::utils::time::now_ms;

/// Subscriber metadata fields
const FIELD_USER_ID: &str = "userId";
const FIELD_TOPIC_ID: &str = "topicId";
const FIELD_LAST_SEEN: &str = "lastSeen";
const FIELD_IS_ACTIVE: &str = "isActive";

/// Topic manager for one replica
pub struct TopicManager {
    store: Arc<StoreService>,
    metrics: Arc<GatewayMetrics>,
    stream_cap: u64,
    queue_cap: usize,
    slow_client_threshold_ms: u64,
    /// Subscribers registered through this replica; the distributor only
    /// enqueues for local interest so replicas never double-write one queue
    local_subs: DashSet<String>,
}

impl TopicManager {
    pub fn new(
        store: Arc<StoreService>,
        metrics: Arc<GatewayMetrics>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            stream_cap: config.max_topic_buffer_size,
            queue_cap: config.max_subscriber_queue_size,
            slow_client_threshold_ms: config.slow_client_threshold_ms,
            local_subs: DashSet::new(),
        }
    }

    // =========================================================================
    // Publish side
    // =========================================================================

    /// Assign the envelope's sequence, append it to the durable stream, and
    /// fan it out through the store's publish channel.
    pub async fn append(&self, env: &mut EventEnvelope) -> Result<u64, GatewayError> {
        let keys = self.store.keys();
        let tenant = env.tenant_id.clone();
        let topic = env.topic_id.clone();

        // The store's atomic increment is the authoritative linearization
        let seq = self.store.incr(&keys.seq(&tenant, &topic)).await?;
        env.seq = seq as u64;

        let data = serde_json::to_string(&env.data)
            .map_err(|e| GatewayError::Internal(format!("payload serialization: {e}")))?;
        let stream_key = keys.stream(&tenant, &topic);
        self.store
            .stream_append(
                &stream_key,
                &[
                    ("id", env.id.clone()),
                    ("type", env.event_type.clone()),
                    ("data", data),
                    ("seq", env.seq.to_string()),
                    ("ts", env.ts.clone()),
                    (FIELD_USER_ID, env.sender_id.clone()),
                ],
            )
            .await?;

        let meta_key = keys.topic_meta(&tenant, &topic);
        let now = now_ms().to_string();
        let mut meta_fields = vec![
            ("lastEventId", env.seq.to_string()),
            ("lastActivityMs", now.clone()),
        ];
        if env.seq == 1 {
            meta_fields.push(("createdAtMs", now));
        }
        self.store.hash_set(&meta_key, &meta_fields).await?;
        self.store.expire(&meta_key, TOPIC_META_TTL_SECS).await?;

        let payload = env
            .to_json()
            .map_err(|e| GatewayError::Internal(format!("envelope serialization: {e}")))?;
        self.store
            .publish(&keys.publish_channel(&tenant, &topic), payload.as_bytes())
            .await?;

        self.store
            .stream_trim_approx(&stream_key, self.stream_cap)
            .await?;

        Ok(env.seq)
    }

    // =========================================================================
    // Subscriber registry
    // =========================================================================

    pub async fn add_subscriber(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        user_id: &str,
    ) -> Result<(), GatewayError> {
        let keys = self.store.keys();
        let meta_key = keys.subscriber_meta(tenant, sub_id);
        self.store
            .hash_set(
                &meta_key,
                &[
                    (FIELD_USER_ID, user_id.to_string()),
                    (FIELD_TOPIC_ID, topic.to_string()),
                    (FIELD_LAST_SEEN, now_ms().to_string()),
                    (FIELD_IS_ACTIVE, "1".to_string()),
                ],
            )
            .await?;
        self.store.expire(&meta_key, SUBSCRIBER_TTL_SECS).await?;
        self.store
            .set_add(&keys.topic_subscribers(tenant, topic), sub_id)
            .await?;
        self.local_subs.insert(sub_id.to_string());
        Ok(())
    }

    pub async fn remove_subscriber(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
    ) -> Result<(), GatewayError> {
        let keys = self.store.keys();
        self.store
            .set_rem(&keys.topic_subscribers(tenant, topic), sub_id)
            .await?;
        self.store.delete(&keys.subscriber_meta(tenant, sub_id)).await?;
        self.store
            .delete(&keys.subscriber_queue(tenant, sub_id, topic))
            .await?;
        self.local_subs.remove(sub_id);
        Ok(())
    }

    /// Refresh a live subscriber's `lastSeen`; proof the consumer is draining
    pub async fn touch_subscriber(&self, tenant: &str, sub_id: &str) -> Result<(), GatewayError> {
        let meta_key = self.store.keys().subscriber_meta(tenant, sub_id);
        self.store
            .hash_set(&meta_key, &[(FIELD_LAST_SEEN, now_ms().to_string())])
            .await?;
        self.store.expire(&meta_key, SUBSCRIBER_TTL_SECS).await?;
        Ok(())
    }

    /// Flag a subscriber for the reaper without touching its queue
    pub async fn mark_inactive(&self, tenant: &str, sub_id: &str) -> Result<(), GatewayError> {
        let meta_key = self.store.keys().subscriber_meta(tenant, sub_id);
        self.store
            .hash_set(&meta_key, &[(FIELD_IS_ACTIVE, "0".to_string())])
            .await?;
        Ok(())
    }

    pub async fn subscriber_ids(
        &self,
        tenant: &str,
        topic: &str,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .store
            .set_members(&self.store.keys().topic_subscribers(tenant, topic))
            .await?)
    }

    /// Whether this replica registered the subscriber
    pub fn is_local_subscriber(&self, sub_id: &str) -> bool {
        self.local_subs.contains(sub_id)
    }

    /// Subscriber-set cardinality and durable-tail length
    pub async fn stats(&self, tenant: &str, topic: &str) -> Result<(u64, u64), GatewayError> {
        let keys = self.store.keys();
        let subscriber_count = self.store.set_card(&keys.topic_subscribers(tenant, topic)).await?;
        let buffer_size = self.store.stream_len(&keys.stream(tenant, topic)).await?;
        Ok((subscriber_count, buffer_size))
    }

    // =========================================================================
    // Per-subscriber queues
    // =========================================================================

    /// Enqueue an envelope onto one subscriber's bounded queue
    pub async fn enqueue(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        env: &EventEnvelope,
    ) -> Result<(), GatewayError> {
        let key = self.store.keys().subscriber_queue(tenant, sub_id, topic);
        let payload = env
            .to_json()
            .map_err(|e| GatewayError::Internal(format!("envelope serialization: {e}")))?;

        if is_coalescible(&env.event_type) {
            let len = self.store.list_len(&key).await? as usize;
            if len * 100 >= self.queue_cap * COALESCE_OCCUPANCY_PCT {
                self.coalesce(&key, env).await?;
            }
        }

        let new_len = self.store.list_push(&key, payload.as_bytes()).await? as usize;
        if new_len > self.queue_cap {
            let dropped = new_len - self.queue_cap;
            self.store.list_trim(&key, dropped as i64, -1).await?;
            self.metrics.incr_dropped(dropped as u64);
            tracing::debug!(
                %sub_id,
                %topic,
                dropped,
                "Subscriber queue overflow, trimmed oldest entries"
            );
        }

        self.store.expire(&key, SUBSCRIBER_TTL_SECS).await?;
        Ok(())
    }

    /// Remove prior queued entries with the same `(type, sender)`
    async fn coalesce(&self, key: &str, env: &EventEnvelope) -> Result<(), GatewayError> {
        let entries = self.store.list_range(key, 0, -1).await?;
        for raw in entries {
            if let Ok(prior) = EventEnvelope::from_json(&raw)
                && prior.event_type == env.event_type
                && prior.sender_id == env.sender_id
            {
                self.store.list_rem(key, &raw).await?;
            }
        }
        Ok(())
    }

    /// Drain up to `max` envelopes from the head of a subscriber's queue
    pub async fn drain_queue(
        &self,
        tenant: &str,
        topic: &str,
        sub_id: &str,
        max: usize,
    ) -> Result<Vec<EventEnvelope>, GatewayError> {
        let key = self.store.keys().subscriber_queue(tenant, sub_id, topic);
        let raw = self.store.list_range(&key, 0, max as i64 - 1).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        self.store.list_trim(&key, raw.len() as i64, -1).await?;

        Ok(raw
            .iter()
            .filter_map(|bytes| match EventEnvelope::from_json(bytes) {
                Ok(env) => Some(env),
                Err(e) => {
                    tracing::warn!(%sub_id, error = %e, "Dropping malformed queue entry");
                    None
                }
            })
            .collect())
    }

    // =========================================================================
    // Backlog
    // =========================================================================

    /// Read retained entries with `seq >= from_seq` in ascending order.
    ///
    /// A `from_seq` older than the tail's minimum returns what remains; the
    /// caller reconciles via its own state.
    pub async fn read_from_seq(
        &self,
        tenant: &str,
        topic: &str,
        from_seq: u64,
        max: usize,
    ) -> Result<Vec<EventEnvelope>, GatewayError> {
        let stream_key = self.store.keys().stream(tenant, topic);
        let entries = self
            .store
            .stream_range_from(&stream_key, from_seq, max.min(BACKLOG_READ_MAX))
            .await?;
        Ok(self.entries_to_envelopes(tenant, topic, entries))
    }

    /// Read the newest `count` retained entries in ascending order
    pub async fn read_history(
        &self,
        tenant: &str,
        topic: &str,
        count: usize,
    ) -> Result<Vec<EventEnvelope>, GatewayError> {
        let stream_key = self.store.keys().stream(tenant, topic);
        let entries = self
            .store
            .stream_range_tail(&stream_key, count.min(BACKLOG_READ_MAX))
            .await?;
        Ok(self.entries_to_envelopes(tenant, topic, entries))
    }

    fn entries_to_envelopes(
        &self,
        tenant: &str,
        topic: &str,
        entries: Vec<StreamEntry>,
    ) -> Vec<EventEnvelope> {
        entries
            .iter()
            .filter_map(|entry| match envelope_from_entry(tenant, topic, entry) {
                Some(env) => Some(env),
                None => {
                    tracing::warn!(%topic, entry_id = %entry.id, "Skipping malformed stream entry");
                    None
                }
            })
            .collect()
    }

    // =========================================================================
    // Reaper
    // =========================================================================

    /// One reaper pass: drop subscribers that are flagged inactive, stale, or
    /// whose metadata expired, and refresh the activity gauges.
    pub async fn reap_once(&self) -> Result<(), GatewayError> {
        let keys = self.store.keys();
        let meta_keys = self.store.keys_by_pattern(&keys.topic_meta_pattern()).await?;

        let mut topics_active = 0i64;
        let mut subscribers_active = 0i64;
        let now = now_ms();

        for meta_key in meta_keys {
            let Some((tenant, topic)) = keys.parse_topic_meta(&meta_key) else {
                continue;
            };
            topics_active += 1;

            let sub_ids = self
                .store
                .set_members(&keys.topic_subscribers(&tenant, &topic))
                .await?;
            for sub_id in sub_ids {
                let meta = self
                    .store
                    .hash_get_all(&keys.subscriber_meta(&tenant, &sub_id))
                    .await?;

                let is_active = meta.get(FIELD_IS_ACTIVE).map(|v| v == "1").unwrap_or(false);
                let last_seen = meta
                    .get(FIELD_LAST_SEEN)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                let stale = now.saturating_sub(last_seen) > self.slow_client_threshold_ms;

                if meta.is_empty() || !is_active || stale {
                    tracing::debug!(%tenant, %topic, %sub_id, is_active, stale, "Reaping subscriber");
                    self.remove_subscriber(&tenant, &topic, &sub_id).await?;
                } else {
                    subscribers_active += 1;
                }
            }
        }

        self.metrics.set_topics_active(topics_active);
        self.metrics.set_subscribers_active(subscribers_active);
        Ok(())
    }
}

/// Rebuild an envelope from its stream entry fields.
///
/// Tenant and topic come from the stream key; `priority` is advisory and is
/// not persisted in the durable tail.
fn envelope_from_entry(tenant: &str, topic: &str, entry: &StreamEntry) -> Option<EventEnvelope> {
    Some(EventEnvelope {
        id: entry.field("id")?.to_string(),
        topic_id: topic.to_string(),
        tenant_id: tenant.to_string(),
        sender_id: entry.field(FIELD_USER_ID)?.to_string(),
        event_type: entry.field("type")?.to_string(),
        data: serde_json::from_str(entry.field("data")?).ok()?,
        seq: entry.field("seq")?.parse().ok()?,
        ts: entry.field("ts")?.to_string(),
        priority: None,
    })
}
