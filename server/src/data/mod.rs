//! Data layer: the shared store adapter

pub mod store;

pub use store::{MemoryStore, RedisStore, StoreError, StoreKeys, StoreService};
