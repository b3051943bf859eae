use std::sync::Arc;

use async_trait::async_trait;
use resourcebase_core::EngineResult;

use crate::filesystem::{FilesystemCacheDriver, PartitionAwareFilesystemCacheDriver};
use crate::memory::MemoryCacheDriver;
use crate::multitier::MultiTierCacheDriver;
use crate::redis::RedisCacheDriver;
use crate::s3::S3CacheDriver;

/// Minimal protocol every cache backend implements.
#[async_trait]
pub trait CacheDriver: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()>;
    async fn delete(&self, key: &str) -> EngineResult<()>;
    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()>;
    async fn size(&self) -> EngineResult<usize>;
    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>>;
}

#[derive(Debug, Clone, Default)]
pub struct PartitionStats {
    pub entry_count: usize,
    pub total_bytes: u64,
}

/// Tagged-sum driver model (REDESIGN FLAGS): engines switch on this tag instead
/// of probing a driver's runtime type. Every variant still implements
/// [`CacheDriver`] by delegation, and [`CacheDriverKind::clear_partition`]
/// exposes the one genuinely capability-gated operation.
#[derive(Clone)]
pub enum CacheDriverKind {
    Memory(Arc<MemoryCacheDriver>),
    Filesystem(Arc<FilesystemCacheDriver>),
    PartitionAwareFilesystem(Arc<PartitionAwareFilesystemCacheDriver>),
    S3(Arc<S3CacheDriver>),
    Redis(Arc<RedisCacheDriver>),
    MultiTier(Arc<MultiTierCacheDriver>),
}

#[async_trait]
impl CacheDriver for CacheDriverKind {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match self {
            CacheDriverKind::Memory(d) => d.get(key).await,
            CacheDriverKind::Filesystem(d) => d.get(key).await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.get(key).await,
            CacheDriverKind::S3(d) => d.get(key).await,
            CacheDriverKind::Redis(d) => d.get(key).await,
            CacheDriverKind::MultiTier(d) => d.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        match self {
            CacheDriverKind::Memory(d) => d.set(key, value).await,
            CacheDriverKind::Filesystem(d) => d.set(key, value).await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.set(key, value).await,
            CacheDriverKind::S3(d) => d.set(key, value).await,
            CacheDriverKind::Redis(d) => d.set(key, value).await,
            CacheDriverKind::MultiTier(d) => d.set(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        match self {
            CacheDriverKind::Memory(d) => d.delete(key).await,
            CacheDriverKind::Filesystem(d) => d.delete(key).await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.delete(key).await,
            CacheDriverKind::S3(d) => d.delete(key).await,
            CacheDriverKind::Redis(d) => d.delete(key).await,
            CacheDriverKind::MultiTier(d) => d.delete(key).await,
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()> {
        match self {
            CacheDriverKind::Memory(d) => d.clear_prefix(prefix).await,
            CacheDriverKind::Filesystem(d) => d.clear_prefix(prefix).await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.clear_prefix(prefix).await,
            CacheDriverKind::S3(d) => d.clear_prefix(prefix).await,
            CacheDriverKind::Redis(d) => d.clear_prefix(prefix).await,
            CacheDriverKind::MultiTier(d) => d.clear_prefix(prefix).await,
        }
    }

    async fn size(&self) -> EngineResult<usize> {
        match self {
            CacheDriverKind::Memory(d) => d.size().await,
            CacheDriverKind::Filesystem(d) => d.size().await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.size().await,
            CacheDriverKind::S3(d) => d.size().await,
            CacheDriverKind::Redis(d) => d.size().await,
            CacheDriverKind::MultiTier(d) => d.size().await,
        }
    }

    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        match self {
            CacheDriverKind::Memory(d) => d.keys(prefix).await,
            CacheDriverKind::Filesystem(d) => d.keys(prefix).await,
            CacheDriverKind::PartitionAwareFilesystem(d) => d.keys(prefix).await,
            CacheDriverKind::S3(d) => d.keys(prefix).await,
            CacheDriverKind::Redis(d) => d.keys(prefix).await,
            CacheDriverKind::MultiTier(d) => d.keys(prefix).await,
        }
    }
}

impl CacheDriverKind {
    /// Partition-aware clear where the driver supports it; falls back to a plain
    /// prefix clear for every other driver kind.
    pub async fn clear_partition(&self, partition_prefix: &str) -> EngineResult<()> {
        match self {
            CacheDriverKind::PartitionAwareFilesystem(d) => d.clear_partition(partition_prefix).await,
            other => other.clear_prefix(partition_prefix).await,
        }
    }

    pub async fn partition_stats(&self, partition_prefix: &str) -> EngineResult<PartitionStats> {
        match self {
            CacheDriverKind::PartitionAwareFilesystem(d) => d.partition_stats(partition_prefix).await,
            other => {
                let keys = other.keys(partition_prefix).await?;
                Ok(PartitionStats { entry_count: keys.len(), total_bytes: 0 })
            }
        }
    }
}
