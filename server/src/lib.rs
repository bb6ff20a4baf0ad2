//! Beacon: multi-tenant realtime event gateway.
//!
//! Producers publish typed events to logical topics; subscribers hold
//! long-lived streams and receive events in per-topic order, with optional
//! replay from a caller-supplied sequence. A Redis-compatible store is the
//! source of truth for ordering, durability, fan-out across replicas, rate
//! limits, and presence; replicas themselves are stateless.

pub mod app;
pub mod core;
pub mod data;
pub mod domain;
pub mod utils;
