//! Store key layout
//!
//! Every key is namespaced `{prefix}:…:{tenant}:{topic}` so a single store can
//! serve many tenants. The layout is bit-exact across replicas; changing any
//! format here breaks cross-replica compatibility.

/// Builds namespaced store keys for one configured prefix
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Durable per-topic event stream
    pub fn stream(&self, tenant: &str, topic: &str) -> String {
        format!("{}:stream:{}:{}", self.prefix, tenant, topic)
    }

    /// Cross-replica publish channel
    pub fn publish_channel(&self, tenant: &str, topic: &str) -> String {
        format!("{}:pub:{}:{}", self.prefix, tenant, topic)
    }

    /// Pattern matching every tenant/topic publish channel
    pub fn publish_pattern(&self) -> String {
        format!("{}:pub:*:*", self.prefix)
    }

    /// Per-topic sequence counter
    pub fn seq(&self, tenant: &str, topic: &str) -> String {
        format!("{}:seq:{}:{}", self.prefix, tenant, topic)
    }

    /// Topic metadata hash
    pub fn topic_meta(&self, tenant: &str, topic: &str) -> String {
        format!("{}:topic:{}:{}:meta", self.prefix, tenant, topic)
    }

    /// Pattern matching every topic metadata hash
    pub fn topic_meta_pattern(&self) -> String {
        format!("{}:topic:*:meta", self.prefix)
    }

    /// Topic subscriber set
    pub fn topic_subscribers(&self, tenant: &str, topic: &str) -> String {
        format!("{}:topic:{}:{}:subscribers", self.prefix, tenant, topic)
    }

    /// Subscriber metadata hash
    pub fn subscriber_meta(&self, tenant: &str, sub_id: &str) -> String {
        format!("{}:subscriber:{}:{}:meta", self.prefix, tenant, sub_id)
    }

    /// Per-subscriber bounded queue
    pub fn subscriber_queue(&self, tenant: &str, sub_id: &str, topic: &str) -> String {
        format!("{}:sub:{}:{}:topic:{}:queue", self.prefix, tenant, sub_id, topic)
    }

    /// Per-{tenant, topic} rate limit sorted set
    pub fn topic_rate_limit(&self, tenant: &str, topic: &str) -> String {
        format!("{}:rl:{}:{}", self.prefix, tenant, topic)
    }

    /// Presence hash
    pub fn presence(&self, tenant: &str, topic: &str) -> String {
        format!("{}:presence:{}:{}", self.prefix, tenant, topic)
    }

    /// Cached access decision
    pub fn acl(&self, topic: &str, user: &str) -> String {
        format!("{}:acl:{}:{}", self.prefix, topic, user)
    }

    /// Per-{principal, action} rate limit key (unprefixed; shared with the
    /// identity layer's limiter namespace)
    pub fn user_action_rate_limit(user_id: &str, action: &str) -> String {
        format!("rate_limit:user:{}:{}", user_id, action)
    }

    /// Parse `{tenant, topic}` out of a publish channel name.
    ///
    /// The tenant is everything up to the first `:` after the prefix; the
    /// remainder is the topic (topic ids may themselves contain `:`).
    pub fn parse_publish_channel(&self, channel: &str) -> Option<(String, String)> {
        let suffix = channel.strip_prefix(&format!("{}:pub:", self.prefix))?;
        let (tenant, topic) = suffix.split_once(':')?;
        if tenant.is_empty() || topic.is_empty() {
            return None;
        }
        Some((tenant.to_string(), topic.to_string()))
    }

    /// Parse `{tenant, topic}` out of a topic metadata key.
    pub fn parse_topic_meta(&self, key: &str) -> Option<(String, String)> {
        let suffix = key.strip_prefix(&format!("{}:topic:", self.prefix))?;
        let suffix = suffix.strip_suffix(":meta")?;
        let (tenant, topic) = suffix.split_once(':')?;
        if tenant.is_empty() || topic.is_empty() {
            return None;
        }
        Some((tenant.to_string(), topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> StoreKeys {
        StoreKeys::new("rt")
    }

    #[test]
    fn test_key_layout() {
        let k = keys();
        assert_eq!(k.stream("t1", "doc:123"), "rt:stream:t1:doc:123");
        assert_eq!(k.publish_channel("t1", "doc:123"), "rt:pub:t1:doc:123");
        assert_eq!(k.seq("t1", "doc:123"), "rt:seq:t1:doc:123");
        assert_eq!(k.topic_meta("t1", "doc:123"), "rt:topic:t1:doc:123:meta");
        assert_eq!(
            k.topic_subscribers("t1", "doc:123"),
            "rt:topic:t1:doc:123:subscribers"
        );
        assert_eq!(k.subscriber_meta("t1", "s1"), "rt:subscriber:t1:s1:meta");
        assert_eq!(
            k.subscriber_queue("t1", "s1", "doc:123"),
            "rt:sub:t1:s1:topic:doc:123:queue"
        );
        assert_eq!(k.topic_rate_limit("t1", "doc:123"), "rt:rl:t1:doc:123");
        assert_eq!(k.presence("t1", "doc:123"), "rt:presence:t1:doc:123");
        assert_eq!(k.acl("doc:123", "u1"), "rt:acl:doc:123:u1");
        assert_eq!(
            StoreKeys::user_action_rate_limit("u1", "publish"),
            "rate_limit:user:u1:publish"
        );
    }

    #[test]
    fn test_publish_pattern() {
        assert_eq!(keys().publish_pattern(), "rt:pub:*:*");
    }

    #[test]
    fn test_parse_publish_channel() {
        let k = keys();
        assert_eq!(
            k.parse_publish_channel("rt:pub:t1:doc:123"),
            Some(("t1".to_string(), "doc:123".to_string()))
        );
        assert_eq!(k.parse_publish_channel("rt:pub:t1"), None);
        assert_eq!(k.parse_publish_channel("other:pub:t1:doc"), None);
    }

    #[test]
    fn test_parse_topic_meta() {
        let k = keys();
        assert_eq!(
            k.parse_topic_meta("rt:topic:t1:doc:123:meta"),
            Some(("t1".to_string(), "doc:123".to_string()))
        );
        assert_eq!(k.parse_topic_meta("rt:topic:t1:meta"), None);
        assert_eq!(k.parse_topic_meta("rt:stream:t1:doc"), None);
    }
}
