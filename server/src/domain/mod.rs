//! Event plane domain logic

pub mod acl;
pub mod bus;
pub mod distributor;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod presence;
pub mod principal;
pub mod publish;
pub mod ratelimit;
pub mod subscription;
pub mod topic;

pub use acl::{AclFailurePolicy, AclService, AclSource, PermissionAclSource, PermitAllAclSource};
pub use bus::EventBus;
pub use distributor::EventDistributor;
pub use envelope::EventEnvelope;
pub use error::GatewayError;
pub use gateway::{EventGateway, TopicStats};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use presence::PresenceService;
pub use principal::Principal;
pub use publish::{PublishInput, PublishReceipt, PublishService};
pub use ratelimit::RateLimitService;
pub use subscription::{SubscribeRequest, SubscriptionStream};
pub use topic::TopicManager;
