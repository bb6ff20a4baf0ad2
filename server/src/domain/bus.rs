//! In-process broadcast bus
//!
//! Single-replica multi-consumer broadcast keyed by channel name. Active
//! subscription streams on this replica tail their topic's channel; the
//! distributor is the only writer.
//!
//! Consumers that cannot keep up are skipped for the offending delivery; the
//! per-subscriber durable queue is the authoritative backpressure path. There
//! is no replay: a subscription observes only values published after it was
//! installed.
//!
//! Channel lifecycle follows reference counting: the channel is created on
//! first subscribe and removed shortly after the last subscriber drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::envelope::EventEnvelope;
use crate::core::constants::{BUS_CHANNEL_CAPACITY, BUS_TOPIC_CHANNEL_PREFIX};

/// Delay before removing an idle channel, allowing quick re-subscribes
const CHANNEL_CLEANUP_DELAY: Duration = Duration::from_millis(100);

/// Bus channel name for a {tenant, topic} pair
pub fn topic_channel(tenant: &str, topic: &str) -> String {
    format!("{BUS_TOPIC_CHANNEL_PREFIX}:{tenant}:{topic}")
}

/// One broadcast channel and its subscriber count
struct BusChannel {
    name: String,
    sender: broadcast::Sender<Arc<EventEnvelope>>,
    subscriber_count: AtomicU64,
}

/// Per-replica multi-consumer broadcast bus
pub struct EventBus {
    channels: RwLock<HashMap<String, Arc<BusChannel>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Deliver a value to every consumer currently subscribed to `channel`.
    ///
    /// Returns the number of consumers that received it; zero when the
    /// channel has no subscribers (the value is dropped, not queued).
    pub fn publish(&self, channel: &str, value: Arc<EventEnvelope>) -> usize {
        let Some(bus_channel) = self.channels.read().get(channel).cloned() else {
            return 0;
        };
        bus_channel.sender.send(value).unwrap_or(0)
    }

    /// Subscribe to a channel; values published before this call are not
    /// replayed.
    pub fn subscribe(self: &Arc<Self>, channel: &str) -> BusSubscription {
        let bus_channel = self.get_or_create(channel);
        bus_channel.subscriber_count.fetch_add(1, Ordering::SeqCst);
        BusSubscription {
            receiver: bus_channel.sender.subscribe(),
            channel: Arc::clone(&bus_channel),
            bus: Arc::clone(self),
        }
    }

    /// Number of consumers on a channel (zero when absent)
    pub fn subscriber_count(&self, channel: &str) -> u64 {
        self.channels
            .read()
            .get(channel)
            .map(|c| c.subscriber_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn get_or_create(&self, channel: &str) -> Arc<BusChannel> {
        if let Some(existing) = self.channels.read().get(channel) {
            return Arc::clone(existing);
        }

        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(channel) {
            return Arc::clone(existing);
        }

        let (sender, _) = broadcast::channel(self.capacity);
        let bus_channel = Arc::new(BusChannel {
            name: channel.to_string(),
            sender,
            subscriber_count: AtomicU64::new(0),
        });
        channels.insert(channel.to_string(), Arc::clone(&bus_channel));
        bus_channel
    }

    fn remove_if_idle(&self, channel: &str) {
        let mut channels = self.channels.write();
        if let Some(c) = channels.get(channel)
            && c.subscriber_count.load(Ordering::SeqCst) == 0
        {
            channels.remove(channel);
            tracing::trace!(channel, "Removed idle bus channel");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's handle on one bus channel; cleans up on drop
pub struct BusSubscription {
    receiver: broadcast::Receiver<Arc<EventEnvelope>>,
    channel: Arc<BusChannel>,
    bus: Arc<EventBus>,
}

/// Outcome of one receive attempt
pub enum BusRecv {
    /// Next value in per-channel FIFO order
    Value(Arc<EventEnvelope>),
    /// This consumer fell behind and `skipped` deliveries were dropped for it
    Lagged(u64),
    /// The channel is gone
    Closed,
}

impl BusSubscription {
    pub async fn recv(&mut self) -> BusRecv {
        match self.receiver.recv().await {
            Ok(value) => BusRecv::Value(value),
            Err(broadcast::error::RecvError::Lagged(n)) => BusRecv::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => BusRecv::Closed,
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        let remaining = self
            .channel
            .subscriber_count
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);

        if remaining == 0 {
            let bus = Arc::clone(&self.bus);
            let name = self.channel.name.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    tokio::time::sleep(CHANNEL_CLEANUP_DELAY).await;
                    bus.remove_if_idle(&name);
                });
            } else {
                bus.remove_if_idle(&name);
            }
        }
    }
}
