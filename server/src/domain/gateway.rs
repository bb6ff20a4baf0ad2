//! Event gateway facade
//!
//! The operation surface any transport consumes: publish, subscribe,
//! presence, topic stats, and event history. One `EventGateway` is one
//! replica; replicas share nothing but the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::acl::{AclFailurePolicy, AclService, AclSource};
use super::bus::EventBus;
use super::distributor::EventDistributor;
use super::envelope::EventEnvelope;
use super::error::GatewayError;
use super::metrics::GatewayMetrics;
use super::presence::PresenceService;
use super::principal::Principal;
use super::publish::{PublishInput, PublishReceipt, PublishService, validate_topic_id};
use super::ratelimit::RateLimitService;
use super::subscription::{self, SubscribeRequest, SubscriptionStream};
use super::topic::TopicManager;
use crate::core::config::GatewayConfig;
use crate::core::constants::{HISTORY_DEFAULT_COUNT, REAPER_INTERVAL_SECS};
use crate::data::store::StoreService;

/// Point-in-time topic statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    pub subscriber_count: u64,
    pub buffer_size: u64,
}

/// One gateway replica
pub struct EventGateway {
    config: GatewayConfig,
    store: Arc<StoreService>,
    metrics: Arc<GatewayMetrics>,
    topics: Arc<TopicManager>,
    limiter: Arc<RateLimitService>,
    acl: Arc<AclService>,
    presence: PresenceService,
    publisher: PublishService,
    bus: Arc<EventBus>,
    distributor: Arc<EventDistributor>,
    shutdown_tx: watch::Sender<bool>,
}

impl EventGateway {
    /// Build a replica against the configured store backend
    pub async fn new(
        config: GatewayConfig,
        acl_source: Arc<dyn AclSource>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let store = Arc::new(StoreService::new(&config.store, &config.prefix).await?);
        Self::with_store(config, store, acl_source)
    }

    /// Build a replica over an existing store service
    pub fn with_store(
        config: GatewayConfig,
        store: Arc<StoreService>,
        acl_source: Arc<dyn AclSource>,
    ) -> Result<Self, GatewayError> {
        config
            .validate()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let metrics = Arc::new(GatewayMetrics::new());
        let topics = Arc::new(TopicManager::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            &config,
        ));
        let limiter = Arc::new(RateLimitService::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
            &config.rate_limit,
        ));
        let acl = Arc::new(
            AclService::new(
                Arc::clone(&store),
                acl_source,
                AclFailurePolicy::for_environment(config.environment),
                config.environment,
            )
            .map_err(GatewayError::Internal)?,
        );
        let presence = PresenceService::new(Arc::clone(&store));
        let bus = Arc::new(EventBus::new());
        let distributor = Arc::new(EventDistributor::new(
            Arc::clone(&store),
            Arc::clone(&topics),
            Arc::clone(&bus),
        ));
        let publisher = PublishService::new(
            Arc::clone(&topics),
            Arc::clone(&limiter),
            Arc::clone(&acl),
            Arc::clone(&metrics),
            config.max_payload_bytes,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            metrics,
            topics,
            limiter,
            acl,
            presence,
            publisher,
            bus,
            distributor,
            shutdown_tx,
        })
    }

    /// Spawn the distributor and the periodic reaper
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let distributor_handle = Arc::clone(&self.distributor).start(self.shutdown_tx.subscribe());

        let topics = Arc::clone(&self.topics);
        let limiter = Arc::clone(&self.limiter);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reaper_handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = topics.reap_once().await {
                            tracing::warn!(error = %e, "Reaper pass failed");
                        }
                        limiter.reap_fallback();
                    }
                }
            }
            tracing::debug!("Reaper stopped");
        });

        vec![distributor_handle, reaper_handle]
    }

    /// Cancel subscriptions and background tasks
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn publish(
        &self,
        principal: Option<&Principal>,
        input: PublishInput,
    ) -> Result<PublishReceipt, GatewayError> {
        self.publisher.publish_event(principal, input).await
    }

    pub async fn subscribe(
        &self,
        principal: Option<&Principal>,
        request: SubscribeRequest,
    ) -> Result<SubscriptionStream, GatewayError> {
        let started = Instant::now();
        let result = self.subscribe_inner(principal, request).await;
        match &result {
            Ok(_) => self.metrics.observe_subscribe_setup_latency(started.elapsed()),
            Err(e) => self.metrics.incr_error(e.kind()),
        }
        result
    }

    async fn subscribe_inner(
        &self,
        principal: Option<&Principal>,
        request: SubscribeRequest,
    ) -> Result<SubscriptionStream, GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(&request.topic_id)?;

        if !self
            .acl
            .check_topic_access(principal, &request.topic_id)
            .await
        {
            return Err(GatewayError::AccessDenied {
                topic: request.topic_id,
            });
        }

        subscription::open(
            Arc::clone(&self.topics),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            self.shutdown_tx.subscribe(),
            self.config.durability_enabled,
            principal.tenant_id.clone(),
            request.topic_id,
            principal.user_id.clone(),
            request.from_seq,
        )
        .await
    }

    pub async fn join(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> Result<(), GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        self.presence
            .join(&principal.tenant_id, topic_id, &principal.user_id)
            .await
    }

    pub async fn leave(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> Result<(), GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        self.presence
            .leave(&principal.tenant_id, topic_id, &principal.user_id)
            .await
    }

    pub async fn heartbeat(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> Result<(), GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        self.presence
            .heartbeat(&principal.tenant_id, topic_id, &principal.user_id)
            .await
    }

    pub async fn presence_list(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> Result<Vec<String>, GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        self.presence.list(&principal.tenant_id, topic_id).await
    }

    pub async fn topic_stats(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
    ) -> Result<TopicStats, GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        if !self.acl.check_topic_access(principal, topic_id).await {
            return Err(GatewayError::AccessDenied {
                topic: topic_id.to_string(),
            });
        }

        let (subscriber_count, buffer_size) =
            self.topics.stats(&principal.tenant_id, topic_id).await?;
        Ok(TopicStats {
            subscriber_count,
            buffer_size,
        })
    }

    pub async fn event_history(
        &self,
        principal: Option<&Principal>,
        topic_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<EventEnvelope>, GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;
        validate_topic_id(topic_id)?;
        if !self.acl.check_topic_access(principal, topic_id).await {
            return Err(GatewayError::AccessDenied {
                topic: topic_id.to_string(),
            });
        }

        self.topics
            .read_history(
                &principal.tenant_id,
                topic_id,
                count.unwrap_or(HISTORY_DEFAULT_COUNT),
            )
            .await
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        Ok(self.store.health_check().await?)
    }

    // =========================================================================
    // Accessors for embedding transports
    // =========================================================================

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn topics(&self) -> Arc<TopicManager> {
        Arc::clone(&self.topics)
    }

    pub fn store(&self) -> Arc<StoreService> {
        Arc::clone(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Environment;
    use crate::data::store::MemoryStore;
    use crate::domain::acl::PermitAllAclSource;
    use futures::StreamExt;
    use serde_json::json;

    fn gateway_with(config: GatewayConfig, backend: Arc<MemoryStore>) -> EventGateway {
        let store = Arc::new(StoreService::with_backend(
            backend,
            &config.prefix,
            config.store.deadline_ms,
        ));
        EventGateway::with_store(config, store, Arc::new(PermitAllAclSource)).unwrap()
    }

    fn gateway() -> EventGateway {
        gateway_with(GatewayConfig::default(), Arc::new(MemoryStore::new()))
    }

    fn principal(user: &str, tenant: &str) -> Principal {
        Principal::new(user, tenant)
    }

    fn publish_input(topic: &str, event_type: &str, data: serde_json::Value) -> PublishInput {
        PublishInput {
            topic_id: topic.to_string(),
            event_type: event_type.to_string(),
            data,
            priority: None,
        }
    }

    async fn next_envelope(stream: &mut SubscriptionStream) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
            .expect("stream errored")
    }

    #[tokio::test]
    async fn test_publish_receive_round_trip() {
        let gw = gateway();
        let _tasks = gw.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = gw
            .subscribe(
                Some(&principal("u2", "t1")),
                SubscribeRequest {
                    topic_id: "doc:123".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();

        gw.publish(
            Some(&principal("u1", "t1")),
            publish_input("doc:123", "metric", json!({"n": 1})),
        )
        .await
        .unwrap();

        let env = next_envelope(&mut stream).await;
        assert_eq!(env.tenant_id, "t1");
        assert_eq!(env.sender_id, "u1");
        assert_eq!(env.event_type, "metric");
        assert_eq!(env.data["n"], 1);
        assert_eq!(env.seq, 1);

        gw.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_replay_and_resume() {
        let config = GatewayConfig {
            durability_enabled: true,
            ..Default::default()
        };
        let gw = gateway_with(config, Arc::new(MemoryStore::new()));
        let _tasks = gw.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let publisher = principal("u1", "t1");
        for n in 1..=3 {
            gw.publish(
                Some(&publisher),
                publish_input("doc:123", "op", json!({"n": n})),
            )
            .await
            .unwrap();
        }
        // Let the distributor finish fanning out the backlog publishes so the
        // live tail below starts clean
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut stream = gw
            .subscribe(
                Some(&principal("u2", "t1")),
                SubscribeRequest {
                    topic_id: "doc:123".to_string(),
                    from_seq: Some(2),
                },
            )
            .await
            .unwrap();

        assert_eq!(next_envelope(&mut stream).await.seq, 2);
        assert_eq!(next_envelope(&mut stream).await.seq, 3);

        gw.publish(
            Some(&publisher),
            publish_input("doc:123", "op", json!({"n": 4})),
        )
        .await
        .unwrap();
        assert_eq!(next_envelope(&mut stream).await.seq, 4);

        gw.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_at_least_once_across_replay_boundary() {
        let config = GatewayConfig {
            durability_enabled: true,
            ..Default::default()
        };
        let gw = gateway_with(config, Arc::new(MemoryStore::new()));
        let _tasks = gw.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let publisher = principal("u1", "t1");
        let consumer = principal("u2", "t1");

        let mut stream = gw
            .subscribe(
                Some(&consumer),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();

        for n in 1..=2 {
            gw.publish(Some(&publisher), publish_input("doc", "op", json!({"n": n})))
                .await
                .unwrap();
        }
        let mut max_seq = 0;
        for _ in 0..2 {
            max_seq = max_seq.max(next_envelope(&mut stream).await.seq);
        }
        assert_eq!(max_seq, 2);

        // Disconnect, miss two publishes, resubscribe from max_seq + 1
        drop(stream);
        for n in 3..=4 {
            gw.publish(Some(&publisher), publish_input("doc", "op", json!({"n": n})))
                .await
                .unwrap();
        }

        let mut resumed = gw
            .subscribe(
                Some(&consumer),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: Some(max_seq + 1),
                },
            )
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(next_envelope(&mut resumed).await.seq);
        }
        // Duplicates allowed, gaps not: everything published while away arrives
        assert!(seen.contains(&3));
        assert!(seen.contains(&4));

        gw.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_tenant_isolation() {
        let gw = gateway();
        let _tasks = gw.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut same_tenant = gw
            .subscribe(
                Some(&principal("u2", "t1")),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();
        let mut other_tenant = gw
            .subscribe(
                Some(&principal("u3", "t2")),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();

        gw.publish(
            Some(&principal("u1", "t1")),
            publish_input("doc", "op", json!({})),
        )
        .await
        .unwrap();

        assert_eq!(next_envelope(&mut same_tenant).await.tenant_id, "t1");
        // The identical topic name under another tenant sees nothing
        let nothing =
            tokio::time::timeout(Duration::from_millis(300), other_tenant.next()).await;
        assert!(nothing.is_err());

        gw.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_slow_client_queue_capped_with_oldest_dropped() {
        let gw = gateway();
        let _tasks = gw.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Register a subscriber whose consumer never polls
        let stalled = gw
            .subscribe(
                Some(&principal("u9", "t1")),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();
        let sub_id = stalled.subscriber_id().to_string();

        // 150 publishes, spread across senders to stay inside the per-user
        // local frequency window
        let senders = [
            principal("u1", "t1"),
            principal("u2", "t1"),
            principal("u3", "t1"),
        ];
        for n in 0..150 {
            gw.publish(
                Some(&senders[n % 3]),
                publish_input("doc", "op", json!({"n": n})),
            )
            .await
            .unwrap();
        }

        // Wait for the distributor to drain the fan-out
        let deadline = Instant::now() + Duration::from_secs(3);
        while gw.metrics().events_dropped() < 50 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let drained = gw
            .topics()
            .drain_queue("t1", "doc", &sub_id, 1000)
            .await
            .unwrap();
        assert_eq!(drained.len(), 100);
        assert_eq!(drained.first().unwrap().seq, 51);
        assert_eq!(drained.last().unwrap().seq, 150);
        assert_eq!(gw.metrics().events_dropped(), 50);

        gw.trigger_shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fails_closed_without_store() {
        let backend = Arc::new(MemoryStore::new());
        let gw = gateway_with(GatewayConfig::default(), Arc::clone(&backend));

        backend.set_available(false);

        let p = principal("u1", "t1");
        let mut admitted = 0;
        let mut rate_limited = 0;
        let mut last_reset = 0;
        for _ in 0..20 {
            match gw
                .publish(Some(&p), publish_input("doc", "op", json!({})))
                .await
            {
                // Admitted by the fallback limiter, failed at the append
                Err(GatewayError::StoreUnavailable(_)) => admitted += 1,
                Err(GatewayError::RateLimited { reset_at }) => {
                    rate_limited += 1;
                    last_reset = reset_at;
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        // 10% of the configured 100 per window
        assert_eq!(admitted, 10);
        assert_eq!(rate_limited, 10);
        assert!(last_reset <= crate::utils::time::now_secs() + 60);
    }

    #[tokio::test]
    async fn test_cross_replica_fan_out() {
        let backend = Arc::new(MemoryStore::new());
        let producer = gateway_with(GatewayConfig::default(), Arc::clone(&backend));
        let consumer_replica = gateway_with(GatewayConfig::default(), Arc::clone(&backend));

        let _t1 = producer.start_background_tasks();
        let _t2 = consumer_replica.start_background_tasks();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = consumer_replica
            .subscribe(
                Some(&principal("u2", "t1")),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();

        let receipt = producer
            .publish(
                Some(&principal("u1", "t1")),
                publish_input("doc", "op", json!({"x": 1})),
            )
            .await
            .unwrap();

        let env = next_envelope(&mut stream).await;
        assert_eq!(env.seq, receipt.seq);
        assert_eq!(env.id, receipt.event_id);

        producer.trigger_shutdown();
        consumer_replica.trigger_shutdown();
    }

    #[tokio::test]
    async fn test_presence_operations() {
        let gw = gateway();
        let p1 = principal("u1", "t1");
        let p2 = principal("u2", "t1");

        gw.join(Some(&p1), "doc").await.unwrap();
        gw.join(Some(&p2), "doc").await.unwrap();
        gw.heartbeat(Some(&p1), "doc").await.unwrap();

        let mut members = gw.presence_list(Some(&p1), "doc").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u1".to_string(), "u2".to_string()]);

        gw.leave(Some(&p1), "doc").await.unwrap();
        assert_eq!(gw.presence_list(Some(&p2), "doc").await.unwrap(), vec!["u2"]);

        assert!(matches!(
            gw.join(None, "doc").await,
            Err(GatewayError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_topic_stats_and_history() {
        let gw = gateway();
        let p = principal("u1", "t1");

        for n in 0..5 {
            gw.publish(Some(&p), publish_input("doc", "op", json!({"n": n})))
                .await
                .unwrap();
        }
        let _stream = gw
            .subscribe(
                Some(&principal("u2", "t1")),
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap();

        let stats = gw.topic_stats(Some(&p), "doc").await.unwrap();
        assert_eq!(stats.subscriber_count, 1);
        assert_eq!(stats.buffer_size, 5);

        let history = gw.event_history(Some(&p), "doc", Some(3)).await.unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_subscribe_validates_topic_and_principal() {
        let gw = gateway();

        let err = gw
            .subscribe(
                None,
                SubscribeRequest {
                    topic_id: "doc".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Unauthorized");

        let err = gw
            .subscribe(
                Some(&principal("u1", "t1")),
                SubscribeRequest {
                    topic_id: "doc/bad".to_string(),
                    from_seq: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[test]
    fn test_production_with_auth_disabled_fails_at_startup() {
        let config = GatewayConfig {
            environment: Environment::Production,
            allow_auth_disabled: true,
            ..Default::default()
        };
        let store = Arc::new(StoreService::with_backend(
            Arc::new(MemoryStore::new()),
            "rt",
            2000,
        ));
        let result = EventGateway::with_store(config, store, Arc::new(PermitAllAclSource));
        assert!(result.is_err());
    }
}
