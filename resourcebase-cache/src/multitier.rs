use async_trait::async_trait;
use resourcebase_core::EngineResult;
use tracing::warn;

use crate::driver::{CacheDriver, CacheDriverKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierStrategy {
    /// Every write lands in every tier before returning.
    WriteThrough,
    /// The nearest tier is written synchronously; the rest are written in the
    /// background.
    WriteBack,
    /// Only the nearest tier is written; other tiers are populated lazily by
    /// promotion on a later read hit.
    ReadThrough,
}

pub struct MultiTierConfig {
    pub strategy: TierStrategy,
    pub promote_on_hit: bool,
    pub fallback_on_error: bool,
}

impl Default for MultiTierConfig {
    fn default() -> Self {
        Self { strategy: TierStrategy::WriteThrough, promote_on_hit: true, fallback_on_error: true }
    }
}

/// Ordered composition of drivers (fastest first) with a configurable write
/// strategy and promotion of hits into faster tiers.
pub struct MultiTierCacheDriver {
    tiers: Vec<CacheDriverKind>,
    config: MultiTierConfig,
}

impl MultiTierCacheDriver {
    pub fn new(tiers: Vec<CacheDriverKind>, config: MultiTierConfig) -> Self {
        Self { tiers, config }
    }
}

#[async_trait]
impl CacheDriver for MultiTierCacheDriver {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        for (i, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    if self.config.promote_on_hit {
                        for faster in &self.tiers[..i] {
                            if let Err(e) = faster.set(key, value.clone()).await {
                                warn!(error = %e, "failed to promote cache hit into a faster tier");
                            }
                        }
                    }
                    return Ok(Some(value));
                }
                Ok(None) => continue,
                Err(e) => {
                    if self.config.fallback_on_error {
                        warn!(error = %e, tier = i, "tier read failed, falling back to next tier");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        match self.config.strategy {
            TierStrategy::WriteThrough => {
                for tier in &self.tiers {
                    tier.set(key, value.clone()).await?;
                }
                Ok(())
            }
            TierStrategy::WriteBack => {
                if let Some((first, rest)) = self.tiers.split_first() {
                    first.set(key, value.clone()).await?;
                    for tier in rest {
                        if let Err(e) = tier.set(key, value.clone()).await {
                            warn!(error = %e, "write-back propagation to a slower tier failed");
                        }
                    }
                }
                Ok(())
            }
            TierStrategy::ReadThrough => {
                if let Some(first) = self.tiers.first() {
                    first.set(key, value).await?;
                }
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut last_err = None;
        for tier in &self.tiers {
            if let Err(e) = tier.delete(key).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) if self.tiers.is_empty() => Err(e),
            _ => Ok(()),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()> {
        for tier in &self.tiers {
            tier.clear_prefix(prefix).await?;
        }
        Ok(())
    }

    async fn size(&self) -> EngineResult<usize> {
        match self.tiers.first() {
            Some(tier) => tier.size().await,
            None => Ok(0),
        }
    }

    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        match self.tiers.first() {
            Some(tier) => tier.keys(prefix).await,
            None => Ok(Vec::new()),
        }
    }
}
