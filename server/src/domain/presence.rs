//! Presence tracking
//!
//! One membership hash per {tenant, topic} mapping user id to the last
//! heartbeat time, with a whole-hash TTL refreshed on any write. Presence is
//! advisory: it never back-pressures publishes and plays no part in
//! durability. Every operation is idempotent.

use std::sync::Arc;

use super::error::GatewayError;
use crate::core::constants::PRESENCE_TTL_SECS;
use crate::data::store::StoreService;
use crate::utils::time::now_ms;

/// Presence service for one replica
pub struct PresenceService {
    store: Arc<StoreService>,
}

impl PresenceService {
    pub fn new(store: Arc<StoreService>) -> Self {
        Self { store }
    }

    /// Record membership; joining twice just refreshes the heartbeat
    pub async fn join(&self, tenant: &str, topic: &str, user_id: &str) -> Result<(), GatewayError> {
        self.touch(tenant, topic, user_id).await
    }

    /// Refresh the member's heartbeat and the hash TTL
    pub async fn heartbeat(
        &self,
        tenant: &str,
        topic: &str,
        user_id: &str,
    ) -> Result<(), GatewayError> {
        self.touch(tenant, topic, user_id).await
    }

    /// Remove membership; absent members are fine
    pub async fn leave(
        &self,
        tenant: &str,
        topic: &str,
        user_id: &str,
    ) -> Result<(), GatewayError> {
        let key = self.store.keys().presence(tenant, topic);
        self.store.hash_del(&key, user_id).await?;
        Ok(())
    }

    /// Current member user ids
    pub async fn list(&self, tenant: &str, topic: &str) -> Result<Vec<String>, GatewayError> {
        let key = self.store.keys().presence(tenant, topic);
        Ok(self.store.hash_keys(&key).await?)
    }

    async fn touch(&self, tenant: &str, topic: &str, user_id: &str) -> Result<(), GatewayError> {
        let key = self.store.keys().presence(tenant, topic);
        self.store
            .hash_set(&key, &[(user_id, now_ms().to_string())])
            .await?;
        self.store.expire(&key, PRESENCE_TTL_SECS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::MemoryStore;

    fn service() -> PresenceService {
        PresenceService::new(Arc::new(StoreService::with_backend(
            Arc::new(MemoryStore::new()),
            "rt",
            2000,
        )))
    }

    #[tokio::test]
    async fn test_join_and_list() {
        let presence = service();
        presence.join("t1", "doc", "u1").await.unwrap();
        presence.join("t1", "doc", "u2").await.unwrap();

        let mut members = presence.list("t1", "doc").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let presence = service();
        presence.join("t1", "doc", "u1").await.unwrap();
        presence.join("t1", "doc", "u1").await.unwrap();
        assert_eq!(presence.list("t1", "doc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leave_removes_member() {
        let presence = service();
        presence.join("t1", "doc", "u1").await.unwrap();
        presence.leave("t1", "doc", "u1").await.unwrap();
        assert!(presence.list("t1", "doc").await.unwrap().is_empty());

        // Leaving again is a no-op
        presence.leave("t1", "doc", "u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let presence = service();
        presence.join("t1", "doc", "u1").await.unwrap();
        presence.join("t2", "doc", "u9").await.unwrap();

        assert_eq!(presence.list("t1", "doc").await.unwrap(), vec!["u1"]);
        assert_eq!(presence.list("t2", "doc").await.unwrap(), vec!["u9"]);
    }
}
