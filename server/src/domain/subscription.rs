//! Per-subscriber stream lifecycle
//!
//! One task per active subscription: register, optional backlog replay from
//! `fromSeq`, live tail off the in-process bus, cleanup. Cleanup runs from a
//! drop guard so abrupt transport loss deregisters the subscriber exactly
//! like a graceful close.
//!
//! Ordering: a consumer that replays from a `fromSeq` it holds and then
//! consumes the live tail sees strictly increasing `seq` with no gap. The
//! replay/tail boundary may duplicate (the bus subscription is installed
//! before the backlog read); consumers deduplicate by `id` or `seq`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::watch;

use super::bus::{BusRecv, EventBus, topic_channel};
use super::envelope::EventEnvelope;
use super::error::GatewayError;
use super::metrics::GatewayMetrics;
use super::topic::TopicManager;
use crate::core::constants::{BACKLOG_READ_MAX, SUBSCRIBER_TOUCH_INTERVAL_MS};

/// Subscription request consumed at the boundary
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub topic_id: String,
    /// Replay from this sequence when durability is enabled; `0`/absent
    /// means live tail only
    pub from_seq: Option<u64>,
}

/// An open subscription; a stream of envelopes plus the server-assigned id
pub struct SubscriptionStream {
    subscriber_id: String,
    inner: Pin<Box<dyn Stream<Item = Result<EventEnvelope, GatewayError>> + Send>>,
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("subscriber_id", &self.subscriber_id)
            .finish_non_exhaustive()
    }
}

impl SubscriptionStream {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<EventEnvelope, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Deregisters the subscriber when the stream is dropped, however it ends
struct SubscriberGuard {
    topics: Arc<TopicManager>,
    metrics: Arc<GatewayMetrics>,
    tenant: String,
    topic: String,
    sub_id: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.metrics.add_subscribers_active(-1);
        tracing::trace!(sub_id = %self.sub_id, topic = %self.topic, "Subscription closed");

        let topics = Arc::clone(&self.topics);
        let tenant = self.tenant.clone();
        let topic = self.topic.clone();
        let sub_id = self.sub_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = topics.remove_subscriber(&tenant, &topic, &sub_id).await {
                    tracing::warn!(%sub_id, error = %e, "Subscriber cleanup failed; the reaper will retry");
                }
            });
        }
    }
}

/// What the tail loop decided to do next
enum TailStep {
    Emit(Arc<EventEnvelope>),
    Touch,
    Lagged(u64),
    Stop,
}

/// Register the subscriber and open its envelope stream.
///
/// The caller has already resolved the principal and passed the access
/// check; `tenant`/`user_id` come from the authenticated context.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn open(
    topics: Arc<TopicManager>,
    bus: Arc<EventBus>,
    metrics: Arc<GatewayMetrics>,
    shutdown_rx: watch::Receiver<bool>,
    durability_enabled: bool,
    tenant: String,
    topic: String,
    user_id: String,
    from_seq: Option<u64>,
) -> Result<SubscriptionStream, GatewayError> {
    let sub_id = uuid::Uuid::new_v4().to_string();
    topics.add_subscriber(&tenant, &topic, &sub_id, &user_id).await?;
    metrics.add_subscribers_active(1);

    // Tail first, replay second: the overlap may duplicate but never gaps
    let mut bus_sub = bus.subscribe(&topic_channel(&tenant, &topic));

    let guard = SubscriberGuard {
        topics: Arc::clone(&topics),
        metrics: Arc::clone(&metrics),
        tenant: tenant.clone(),
        topic: topic.clone(),
        sub_id: sub_id.clone(),
    };

    let replay_from = from_seq.unwrap_or(0);
    let mut shutdown_rx = shutdown_rx;
    let subscriber_id = sub_id.clone();

    let inner = stream! {
        let _guard = guard;

        if durability_enabled && replay_from > 0 {
            match topics.read_from_seq(&tenant, &topic, replay_from, BACKLOG_READ_MAX).await {
                Ok(backlog) => {
                    tracing::debug!(%topic, %sub_id, from = replay_from, count = backlog.len(), "Replaying backlog");
                    for env in backlog {
                        metrics.incr_delivered();
                        yield Ok(env);
                    }
                }
                Err(GatewayError::StoreUnavailable(msg)) => {
                    // Degraded: skip replay, keep the live tail
                    tracing::warn!(%topic, %sub_id, error = %msg, "Backlog replay unavailable, continuing live");
                }
                Err(e) => {
                    metrics.incr_error(e.kind());
                    yield Err(e);
                    return;
                }
            }
        }

        let mut touch = tokio::time::interval(Duration::from_millis(SUBSCRIBER_TOUCH_INTERVAL_MS));
        touch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { TailStep::Stop } else { continue }
                }

                recv = bus_sub.recv() => match recv {
                    BusRecv::Value(env) => TailStep::Emit(env),
                    BusRecv::Lagged(n) => TailStep::Lagged(n),
                    BusRecv::Closed => TailStep::Stop,
                },

                _ = touch.tick() => TailStep::Touch,
            };

            match step {
                TailStep::Emit(env) => {
                    metrics.incr_delivered();
                    yield Ok((*env).clone());
                }
                TailStep::Touch => {
                    // Only an actively-polled stream reaches this arm, which
                    // is exactly the liveness the reaper threshold measures
                    if let Err(e) = topics.touch_subscriber(&tenant, &sub_id).await {
                        tracing::debug!(%sub_id, error = %e, "lastSeen refresh failed");
                    }
                }
                TailStep::Lagged(n) => {
                    tracing::warn!(
                        %sub_id,
                        skipped = n,
                        "Subscription lagged on the bus; the durable queue holds the backlog"
                    );
                }
                TailStep::Stop => break,
            }
        }
    };

    Ok(SubscriptionStream {
        subscriber_id,
        inner: Box::pin(inner),
    })
}
