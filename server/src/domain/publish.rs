//! Publish path
//!
//! Validation and sanitization, admission control, access check, envelope
//! construction, and delegation to the topic manager. The replica-local
//! frequency window runs before any store round-trip so a flooding client
//! cannot make the gateway hammer the store.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Instant;

use dashmap::DashMap;
use regex::Regex;
use uuid::Uuid;

use super::acl::AclService;
use super::envelope::{BASELINE_EVENT_TYPES, CUSTOM_TYPE_PREFIX, EventEnvelope};
use super::error::GatewayError;
use super::metrics::GatewayMetrics;
use super::principal::Principal;
use super::ratelimit::RateLimitService;
use super::topic::TopicManager;
use crate::core::constants::{
    LOCAL_PUBLISH_MAX, LOCAL_PUBLISH_WINDOW_SECS, MAX_DATA_PROPERTIES, MAX_EVENT_TYPE_LEN,
    MAX_TOPIC_ID_LEN,
};
use crate::utils::sanitize::sanitize_json_value;
use crate::utils::time::{iso_now, now_ms, now_secs};

static TOPIC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-:]{1,200}$").expect("valid regex"));

static TYPE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,100}$").expect("valid regex"));

/// Publish request consumed at the boundary
#[derive(Debug, Clone)]
pub struct PublishInput {
    pub topic_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub priority: Option<i64>,
}

/// Successful publish outcome
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event_id: String,
    pub seq: u64,
}

/// Publish service for one replica
pub struct PublishService {
    topics: Arc<TopicManager>,
    limiter: Arc<RateLimitService>,
    acl: Arc<AclService>,
    metrics: Arc<GatewayMetrics>,
    max_payload_bytes: usize,
    /// Replica-local publish timestamps (ms) per user
    local_windows: DashMap<String, Vec<u64>>,
}

impl PublishService {
    pub fn new(
        topics: Arc<TopicManager>,
        limiter: Arc<RateLimitService>,
        acl: Arc<AclService>,
        metrics: Arc<GatewayMetrics>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            topics,
            limiter,
            acl,
            metrics,
            max_payload_bytes,
            local_windows: DashMap::new(),
        }
    }

    /// Validate, admit, and append one event
    pub async fn publish_event(
        &self,
        principal: Option<&Principal>,
        input: PublishInput,
    ) -> Result<PublishReceipt, GatewayError> {
        let started = Instant::now();
        let result = self.publish_inner(principal, input).await;

        match &result {
            Ok(_) => {
                self.metrics.incr_published();
                self.metrics.observe_publish_latency(started.elapsed());
            }
            Err(e) => self.metrics.incr_error(e.kind()),
        }

        result
    }

    async fn publish_inner(
        &self,
        principal: Option<&Principal>,
        mut input: PublishInput,
    ) -> Result<PublishReceipt, GatewayError> {
        let principal = principal.ok_or(GatewayError::Unauthorized)?;

        let priority = validate_input(&mut input, self.max_payload_bytes)?;

        self.check_local_frequency(&principal.user_id)?;

        let decision = self
            .limiter
            .check_user_action(&principal.user_id, "publish")
            .await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        let decision = self
            .limiter
            .check_tenant_topic(&principal.tenant_id, &input.topic_id)
            .await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        let decision = self.limiter.check_global().await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                reset_at: decision.reset_at,
            });
        }

        if !self.acl.check_topic_access(principal, &input.topic_id).await {
            return Err(GatewayError::AccessDenied {
                topic: input.topic_id.clone(),
            });
        }

        let mut env = EventEnvelope {
            id: Uuid::new_v4().to_string(),
            topic_id: input.topic_id.clone(),
            tenant_id: principal.tenant_id.clone(),
            sender_id: principal.user_id.clone(),
            event_type: input.event_type.clone(),
            data: std::mem::take(&mut input.data),
            seq: 0,
            ts: iso_now(),
            priority,
        };

        let seq = self.topics.append(&mut env).await?;
        tracing::debug!(
            topic = %env.topic_id,
            tenant = %env.tenant_id,
            seq,
            event_type = %env.event_type,
            "Event published"
        );

        Ok(PublishReceipt {
            event_id: env.id,
            seq,
        })
    }

    /// Replica-local flood guard, independent of the store limiter
    fn check_local_frequency(&self, user_id: &str) -> Result<(), GatewayError> {
        let now = now_ms();
        let window_ms = LOCAL_PUBLISH_WINDOW_SECS * 1000;

        let mut entry = self.local_windows.entry(user_id.to_string()).or_default();
        entry.retain(|&ts| ts + window_ms > now);

        if entry.len() >= LOCAL_PUBLISH_MAX {
            let reset_at = entry
                .first()
                .map(|&ts| (ts + window_ms) / 1000)
                .unwrap_or(now_secs() + LOCAL_PUBLISH_WINDOW_SECS);
            return Err(GatewayError::RateLimited { reset_at });
        }

        entry.push(now);
        Ok(())
    }
}

/// Topic id validation shared by the publish and subscribe paths
pub(crate) fn validate_topic_id(topic_id: &str) -> Result<(), GatewayError> {
    if TOPIC_ID_RE.is_match(topic_id) {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput {
            field: "topicId",
            reason: format!("must match [A-Za-z0-9_.:-] and be 1-{MAX_TOPIC_ID_LEN} characters"),
        })
    }
}

/// Structural validation and sanitization; returns the validated priority
fn validate_input(
    input: &mut PublishInput,
    max_payload_bytes: usize,
) -> Result<Option<u8>, GatewayError> {
    validate_topic_id(&input.topic_id)?;

    validate_event_type(&input.event_type)?;

    let priority = match input.priority {
        None => None,
        Some(p @ 0..=9) => Some(p as u8),
        Some(_) => {
            return Err(GatewayError::InvalidInput {
                field: "priority",
                reason: "must be an integer between 0 and 9".to_string(),
            });
        }
    };

    let Some(map) = input.data.as_object() else {
        return Err(GatewayError::InvalidInput {
            field: "data",
            reason: "must be a JSON object".to_string(),
        });
    };
    if map.len() > MAX_DATA_PROPERTIES {
        return Err(GatewayError::InvalidInput {
            field: "data",
            reason: format!("must have at most {MAX_DATA_PROPERTIES} top-level properties"),
        });
    }

    sanitize_json_value(&mut input.data);

    let serialized_len = serde_json::to_vec(&input.data)
        .map_err(|e| GatewayError::Internal(format!("payload serialization: {e}")))?
        .len();
    if serialized_len > max_payload_bytes {
        return Err(GatewayError::PayloadTooLarge {
            max_bytes: max_payload_bytes,
        });
    }

    Ok(priority)
}

fn validate_event_type(event_type: &str) -> Result<(), GatewayError> {
    if let Some(rest) = event_type.strip_prefix(CUSTOM_TYPE_PREFIX) {
        let tag_ok = !rest.is_empty()
            && event_type.len() <= MAX_EVENT_TYPE_LEN
            && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !tag_ok {
            return Err(GatewayError::InvalidInput {
                field: "type",
                reason: "custom types must be 'custom:' followed by [A-Za-z0-9_-]".to_string(),
            });
        }
        return Ok(());
    }

    if !TYPE_TAG_RE.is_match(event_type) || !BASELINE_EVENT_TYPES.contains(&event_type) {
        return Err(GatewayError::InvalidInput {
            field: "type",
            reason: format!(
                "must be one of {BASELINE_EVENT_TYPES:?} or use the '{CUSTOM_TYPE_PREFIX}' namespace"
            ),
        });
    }
    Ok(())
}
