//! C8: granularity-bucketed TTL expiration with cohort sweeping over resources
//! registered through [`plugin::TtlPlugin`].

pub mod index;
pub mod plugin;
pub mod strategy;

pub use index::{entity_id, Granularity, TtlIndexEntry};
pub use plugin::{ResourceTtlConfig, TtlCounters, TtlCountersSnapshot, TtlPlugin};
pub use strategy::{ExpireCallback, ExpireStrategy};
