//! Multi-tier cache engine: drivers, deterministic key derivation, per-resource
//! middleware installation, partition-aware invalidation, and retriable clears.

pub mod driver;
pub mod filesystem;
pub mod key;
pub mod memory;
pub mod multitier;
pub mod plugin;
pub mod redis;
pub mod s3;
pub mod stats;

pub use driver::{CacheDriver, CacheDriverKind, PartitionStats};
pub use key::derive_cache_key;
pub use memory::{MemoryCacheDriver, MemoryDriverConfig};
pub use multitier::{MultiTierCacheDriver, MultiTierConfig, TierStrategy};
pub use plugin::{CacheConfig, CacheNamespace, CachePlugin, ResourceFilter};
pub use stats::{CacheStats, CacheStatsSnapshot};
