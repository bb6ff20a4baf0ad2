// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Beacon";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "beacon";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "beacon.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "BEACON_CONFIG";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "BEACON_LOG";

/// Environment variable for the deploy environment (development or production)
pub const ENV_ENVIRONMENT: &str = "BEACON_ENV";

// =============================================================================
// Environment Variables - Store
// =============================================================================

/// Environment variable for store backend (memory or redis)
pub const ENV_STORE_BACKEND: &str = "BEACON_STORE_BACKEND";

/// Environment variable for the Redis-compatible store URL
pub const ENV_STORE_URL: &str = "BEACON_STORE_URL";

/// Environment variable for the key namespace prefix
pub const ENV_KEY_PREFIX: &str = "BEACON_KEY_PREFIX";

/// Environment variable gating the `fromSeq` replay path
pub const ENV_DURABILITY: &str = "BEACON_DURABILITY";

// =============================================================================
// Key Namespace
// =============================================================================

/// Default key namespace prefix
pub const DEFAULT_KEY_PREFIX: &str = "rt";

/// In-process bus channel prefix for topic events
pub const BUS_TOPIC_CHANNEL_PREFIX: &str = "TOPIC_EVENTS";

// =============================================================================
// Topic Defaults
// =============================================================================

/// Durable stream cap (approximate trim target)
pub const DEFAULT_TOPIC_BUFFER_SIZE: u64 = 1000;

/// Per-subscriber bounded queue cap
pub const DEFAULT_SUBSCRIBER_QUEUE_SIZE: usize = 100;

/// Subscribers idle longer than this are reaped (milliseconds)
pub const DEFAULT_SLOW_CLIENT_THRESHOLD_MS: u64 = 5000;

/// Maximum serialized payload size in bytes
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 65536;

/// Maximum number of top-level properties in the event payload
pub const MAX_DATA_PROPERTIES: usize = 50;

/// Maximum topic id length
pub const MAX_TOPIC_ID_LEN: usize = 200;

/// Maximum event type tag length
pub const MAX_EVENT_TYPE_LEN: usize = 100;

/// Topic metadata TTL from last activity (seconds)
pub const TOPIC_META_TTL_SECS: u64 = 86400;

/// Subscriber metadata and queue TTL on inactivity (seconds)
pub const SUBSCRIBER_TTL_SECS: u64 = 3600;

/// Queue occupancy (percent of cap) at which coalescing kicks in
pub const COALESCE_OCCUPANCY_PCT: usize = 75;

/// Inactive-subscriber reaper interval (seconds)
pub const REAPER_INTERVAL_SECS: u64 = 30;

/// Interval at which an actively-consuming stream refreshes `lastSeen` (milliseconds)
pub const SUBSCRIBER_TOUCH_INTERVAL_MS: u64 = 2000;

/// Maximum entries returned by a backlog read
pub const BACKLOG_READ_MAX: usize = 1000;

/// Default entry count for event history queries
pub const HISTORY_DEFAULT_COUNT: usize = 100;

// =============================================================================
// Presence
// =============================================================================

/// Whole-hash TTL for presence membership (seconds)
pub const PRESENCE_TTL_SECS: u64 = 30;

// =============================================================================
// ACL Cache
// =============================================================================

/// TTL for cached access decisions (seconds)
pub const ACL_CACHE_TTL_SECS: u64 = 30;

// =============================================================================
// Rate Limiting
// =============================================================================

/// Default sliding window in milliseconds
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60000;

/// Default per-{principal, action} limit per window
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 100;

/// Per-{tenant, topic} limit per window
pub const TENANT_TOPIC_RATE_LIMIT: u32 = 1000;

/// Global limit per window
pub const GLOBAL_RATE_LIMIT: u32 = 10000;

/// Global rate limit key (shared across replicas, unprefixed by design)
pub const GLOBAL_RATE_LIMIT_KEY: &str = "rate_limit:global";

/// The in-process fallback enforces `limit / FALLBACK_LIMIT_DIVISOR` when the
/// store is unreachable
pub const FALLBACK_LIMIT_DIVISOR: u32 = 10;

/// Fallback entries whose reset time is older than this are reaped (seconds)
pub const FALLBACK_REAP_AFTER_SECS: u64 = 300;

/// Replica-local per-user publish frequency window (seconds)
pub const LOCAL_PUBLISH_WINDOW_SECS: u64 = 60;

/// Replica-local per-user publish frequency cap
pub const LOCAL_PUBLISH_MAX: usize = 50;

// =============================================================================
// Store Adapter
// =============================================================================

/// Per-call deadline for store operations (milliseconds)
pub const DEFAULT_STORE_DEADLINE_MS: u64 = 2000;

/// Maximum retry attempts for idempotent store commands
pub const STORE_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Base delay for store retry backoff (milliseconds)
pub const STORE_RETRY_BASE_DELAY_MS: u64 = 100;

/// Ceiling for store retry backoff (milliseconds)
pub const STORE_RETRY_MAX_DELAY_MS: u64 = 10000;

/// Failures within the breaker window that open the circuit
pub const BREAKER_FAILURE_THRESHOLD: usize = 5;

/// Window over which breaker failures are counted (seconds)
pub const BREAKER_WINDOW_SECS: u64 = 60;

/// How long an open circuit stays open (seconds)
pub const BREAKER_OPEN_SECS: u64 = 60;

/// Probe attempts admitted while half-open
pub const BREAKER_HALF_OPEN_PROBES: u32 = 3;

// =============================================================================
// In-Process Bus
// =============================================================================

/// Per-channel broadcast capacity
pub const BUS_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Shutdown
// =============================================================================

/// Maximum time to wait for background tasks during shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
