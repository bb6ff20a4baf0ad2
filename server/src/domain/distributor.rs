//! Cross-replica event distribution
//!
//! One long-lived pattern subscription per replica covers every
//! `{prefix}:pub:{tenant}:{topic}` channel on a dedicated connection. Each
//! message is fanned out to the topic's subscriber queues and forwarded to
//! the in-process bus for streams attached to this replica.
//!
//! The distributor is the only bus writer; the publish path never writes to
//! the bus directly, so the producing replica sees no duplicate deliveries.
//!
//! ## Fairness
//!
//! Enqueue order rotates through the subscriber set with a per-topic start
//! index held in replica-local memory. Under saturation this approximates
//! deficit round-robin: no subscriber is always first or always last.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::bus::{EventBus, topic_channel};
use super::envelope::EventEnvelope;
use super::topic::TopicManager;
use crate::data::store::{PatternMessage, StoreService};

/// Delay before re-opening the pattern subscription after an error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Per-replica event distributor
pub struct EventDistributor {
    store: Arc<StoreService>,
    topics: Arc<TopicManager>,
    bus: Arc<EventBus>,
    /// Rotating start index per `{tenant}:{topic}`, replica-local
    rotation: DashMap<String, usize>,
}

impl EventDistributor {
    pub fn new(store: Arc<StoreService>, topics: Arc<TopicManager>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            topics,
            bus,
            rotation: DashMap::new(),
        }
    }

    /// Spawn the distribution task; it reconnects on subscription loss and
    /// stops on the shutdown signal.
    pub fn start(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown_rx).await;
        })
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let pattern = self.store.keys().publish_pattern();

        'outer: loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut listener = match self.store.pattern_listener(&pattern).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::warn!(
                        %pattern,
                        error = %e,
                        "Failed to open pattern subscription, retrying..."
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            tracing::debug!(%pattern, "Distributor subscribed");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break 'outer;
                        }
                    }

                    msg = listener.next() => match msg {
                        Some(msg) => self.dispatch(msg).await,
                        None => {
                            tracing::warn!(%pattern, "Pattern subscription ended, reconnecting...");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        tracing::debug!("Distributor stopped");
    }

    /// Handle one message from the store's publish channel
    async fn dispatch(&self, msg: PatternMessage) {
        let Some((tenant, topic)) = self.store.keys().parse_publish_channel(&msg.channel) else {
            tracing::warn!(channel = %msg.channel, "Ignoring message on unparseable channel");
            return;
        };

        let env = match EventEnvelope::from_json(&msg.payload) {
            Ok(env) => Arc::new(env),
            Err(e) => {
                tracing::warn!(channel = %msg.channel, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        // Only subscribers registered on this replica; other replicas serve
        // their own interest, so one queue never gets the same event twice
        let local_interest = match self.topics.subscriber_ids(&tenant, &topic).await {
            Ok(sub_ids) => sub_ids
                .into_iter()
                .filter(|sub_id| self.topics.is_local_subscriber(sub_id))
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(%tenant, %topic, error = %e, "Failed to read subscriber set");
                Vec::new()
            }
        };

        if !local_interest.is_empty() {
            let rotated = self.rotated(&tenant, &topic, local_interest);
            let tenant_ref = &tenant;
            let topic_ref = &topic;
            let topics = &self.topics;
            let results = futures::future::join_all(rotated.iter().map(|sub_id| {
                let env = Arc::clone(&env);
                async move {
                    topics
                        .enqueue(tenant_ref, topic_ref, sub_id, &env)
                        .await
                        .map_err(|e| (sub_id.clone(), e))
                }
            }))
            .await;

            for result in results {
                if let Err((sub_id, e)) = result {
                    tracing::warn!(%tenant, %topic, %sub_id, error = %e, "Enqueue failed, marking subscriber inactive");
                    if let Err(e) = self.topics.mark_inactive(&tenant, &sub_id).await {
                        tracing::warn!(%sub_id, error = %e, "Failed to mark subscriber inactive");
                    }
                }
            }
        }

        // Streams on this replica tail the bus even when their durable queue
        // was not consulted
        self.bus.publish(&topic_channel(&tenant, &topic), env);
    }

    /// Rotate the subscriber set and advance the per-topic start index
    fn rotated(&self, tenant: &str, topic: &str, sub_ids: Vec<String>) -> Vec<String> {
        if sub_ids.len() <= 1 {
            return sub_ids;
        }

        let key = format!("{tenant}:{topic}");
        let start = {
            let mut entry = self.rotation.entry(key).or_insert(0);
            let start = *entry % sub_ids.len();
            *entry = (start + 1) % sub_ids.len();
            start
        };

        let mut rotated = Vec::with_capacity(sub_ids.len());
        rotated.extend_from_slice(&sub_ids[start..]);
        rotated.extend_from_slice(&sub_ids[..start]);
        rotated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GatewayConfig;
    use crate::data::store::MemoryStore;
    use crate::domain::bus::BusRecv;
    use crate::domain::metrics::GatewayMetrics;
    use serde_json::json;

    fn setup() -> (Arc<StoreService>, Arc<TopicManager>, Arc<EventBus>, Arc<EventDistributor>) {
        let store = Arc::new(StoreService::with_backend(
            Arc::new(MemoryStore::new()),
            "rt",
            2000,
        ));
        let topics = Arc::new(TopicManager::new(
            Arc::clone(&store),
            Arc::new(GatewayMetrics::new()),
            &GatewayConfig::default(),
        ));
        let bus = Arc::new(EventBus::new());
        let distributor = Arc::new(EventDistributor::new(
            Arc::clone(&store),
            Arc::clone(&topics),
            Arc::clone(&bus),
        ));
        (store, topics, bus, distributor)
    }

    fn envelope(seq_hint: u64) -> EventEnvelope {
        EventEnvelope {
            id: format!("e{seq_hint}"),
            topic_id: "doc:123".to_string(),
            tenant_id: "t1".to_string(),
            sender_id: "u1".to_string(),
            event_type: "op".to_string(),
            data: json!({"n": seq_hint}),
            seq: 0,
            ts: crate::utils::time::iso_now(),
            priority: None,
        }
    }

    #[test]
    fn test_rotation_advances_start_index() {
        let (_, _, _, distributor) = setup();
        let subs = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        assert_eq!(
            distributor.rotated("t1", "doc", subs.clone()),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            distributor.rotated("t1", "doc", subs.clone()),
            vec!["b", "c", "a"]
        );
        assert_eq!(
            distributor.rotated("t1", "doc", subs.clone()),
            vec!["c", "a", "b"]
        );
        assert_eq!(distributor.rotated("t1", "doc", subs), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rotation_is_per_topic() {
        let (_, _, _, distributor) = setup();
        let subs = vec!["a".to_string(), "b".to_string()];

        distributor.rotated("t1", "doc", subs.clone());
        // A different topic starts from its own index
        assert_eq!(distributor.rotated("t1", "other", subs), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dispatch_enqueues_and_forwards_to_bus() {
        let (_, topics, bus, distributor) = setup();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&distributor).start(shutdown_rx);

        topics.add_subscriber("t1", "doc:123", "s1", "u2").await.unwrap();
        let mut bus_sub = bus.subscribe(&topic_channel("t1", "doc:123"));

        // Give the distributor time to install its subscription
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut env = envelope(1);
        topics.append(&mut env).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), bus_sub.recv())
            .await
            .expect("bus delivery timed out");
        match received {
            BusRecv::Value(delivered) => {
                assert_eq!(delivered.seq, 1);
                assert_eq!(delivered.tenant_id, "t1");
            }
            _ => panic!("expected value"),
        }

        // The durable queue got the envelope too
        let drained = topics.drain_queue("t1", "doc:123", "s1", 10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].seq, 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_shutdown_stops_distributor() {
        let (_, _, _, distributor) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Arc::clone(&distributor).start(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("distributor did not stop")
            .unwrap();
    }
}
