//! Topic access control cache
//!
//! The ACL source of truth is an external collaborator reached through the
//! `AclSource` trait. Decisions are cached in the store as `"0"`/`"1"`
//! strings with a short TTL so hot topics do not hammer the source.
//!
//! Failure policy: when the source errors, non-production deployments fail
//! open and production fails closed. A configuration that would fail open in
//! production is rejected at construction.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::principal::Principal;
use crate::core::config::Environment;
use crate::core::constants::ACL_CACHE_TTL_SECS;
use crate::data::store::{CircuitBreaker, StoreService};

/// Error from the external ACL source
#[derive(Error, Debug)]
#[error("acl source error: {0}")]
pub struct AclSourceError(pub String);

/// External ACL source of truth
#[async_trait]
pub trait AclSource: Send + Sync {
    async fn check_topic_access(
        &self,
        principal: &Principal,
        topic: &str,
    ) -> Result<bool, AclSourceError>;
}

/// Grants access to every topic; for development with auth disabled
pub struct PermitAllAclSource;

#[async_trait]
impl AclSource for PermitAllAclSource {
    async fn check_topic_access(
        &self,
        _principal: &Principal,
        _topic: &str,
    ) -> Result<bool, AclSourceError> {
        Ok(true)
    }
}

/// Grants access when the principal's permission claims name the topic,
/// either exactly (`topic:{id}`) or via the wildcard (`topic:*`)
pub struct PermissionAclSource;

#[async_trait]
impl AclSource for PermissionAclSource {
    async fn check_topic_access(
        &self,
        principal: &Principal,
        topic: &str,
    ) -> Result<bool, AclSourceError> {
        let wanted = format!("topic:{topic}");
        Ok(principal
            .permissions
            .iter()
            .any(|p| p == &wanted || p == "topic:*"))
    }
}

/// What to do when the ACL source is unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclFailurePolicy {
    FailOpen,
    FailClosed,
}

impl AclFailurePolicy {
    /// The default for a deploy environment
    pub fn for_environment(environment: Environment) -> Self {
        if environment.is_production() {
            AclFailurePolicy::FailClosed
        } else {
            AclFailurePolicy::FailOpen
        }
    }
}

/// Short-TTL cache of access decisions in front of the external source
pub struct AclService {
    store: Arc<StoreService>,
    source: Arc<dyn AclSource>,
    policy: AclFailurePolicy,
    breaker: CircuitBreaker,
}

impl AclService {
    /// Fail-open in production is a misconfiguration, not a choice; it is
    /// rejected here rather than at the first outage.
    pub fn new(
        store: Arc<StoreService>,
        source: Arc<dyn AclSource>,
        policy: AclFailurePolicy,
        environment: Environment,
    ) -> Result<Self, String> {
        if policy == AclFailurePolicy::FailOpen && environment.is_production() {
            return Err(
                "ACL fail-open policy is not permitted in the production environment".to_string(),
            );
        }
        Ok(Self {
            store,
            source,
            policy,
            breaker: CircuitBreaker::new("acl-source"),
        })
    }

    /// Check topic access, consulting the cache first
    pub async fn check_topic_access(&self, principal: &Principal, topic: &str) -> bool {
        let key = self.store.keys().acl(topic, &principal.user_id);

        match self.store.string_get(&key).await {
            Ok(Some(cached)) => return cached == "1",
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%topic, error = %e, "ACL cache read failed, consulting source");
            }
        }

        if !self.breaker.allow() {
            return self.apply_failure_policy(principal, topic, "circuit open");
        }

        match self.source.check_topic_access(principal, topic).await {
            Ok(allowed) => {
                self.breaker.record_success();
                let value = if allowed { "1" } else { "0" };
                if let Err(e) = self
                    .store
                    .string_set_ex(&key, value, ACL_CACHE_TTL_SECS)
                    .await
                {
                    tracing::warn!(%topic, error = %e, "ACL cache write failed");
                }
                allowed
            }
            Err(e) => {
                self.breaker.record_failure();
                self.apply_failure_policy(principal, topic, &e.to_string())
            }
        }
    }

    fn apply_failure_policy(&self, principal: &Principal, topic: &str, reason: &str) -> bool {
        let allowed = self.policy == AclFailurePolicy::FailOpen;
        tracing::error!(
            %topic,
            user = %principal.user_id,
            %reason,
            allowed,
            "ACL source unreachable, applying failure policy"
        );
        allowed
    }
}
