use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use lru::LruCache;
use parking_lot::Mutex;
use resourcebase_core::{EngineError, EngineResult};
use resourcebase_plugin::EventBus;

use crate::driver::CacheDriver;

#[derive(Clone)]
struct StoredEntry {
    bytes: Vec<u8>,
    compressed: bool,
    size: u64,
}

#[derive(Debug, Clone)]
pub struct MemoryDriverConfig {
    pub max_entries: usize,
    pub max_bytes: Option<u64>,
    pub compression_threshold_bytes: usize,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self { max_entries: 10_000, max_bytes: Some(64 * 1024 * 1024), compression_threshold_bytes: 4 * 1024 }
    }
}

impl MemoryDriverConfig {
    /// Resolves a percent-of-capacity byte cap into an absolute `max_bytes`. This
    /// is the only path `maxMemoryPercent` takes to become the `max_bytes` this
    /// driver actually enforces. `host_capacity_bytes` is the caller-resolved
    /// ceiling a percent is taken of — the runtime's heap ceiling, or a cgroup
    /// memory limit when running containerized.
    pub fn from_percent(max_entries: usize, host_capacity_bytes: u64, percent: f32, compression_threshold_bytes: usize) -> Self {
        let max_bytes = (host_capacity_bytes as f64 * (percent as f64 / 100.0)) as u64;
        Self { max_entries, max_bytes: Some(max_bytes), compression_threshold_bytes }
    }

    /// Builds a config from the raw `{maxMemoryBytes, maxMemoryPercent}` pair a
    /// caller configured, rejecting the case where both were supplied (§4.3: the
    /// two are mutually exclusive) and resolving a percent against
    /// `host_capacity_bytes` when given.
    pub fn from_raw_limits(
        max_entries: usize,
        max_memory_bytes: Option<u64>,
        max_memory_percent: Option<f32>,
        host_capacity_bytes: u64,
        compression_threshold_bytes: usize,
    ) -> EngineResult<Self> {
        match (max_memory_bytes, max_memory_percent) {
            (Some(_), Some(_)) => Err(EngineError::configuration_invalid("cache", "maxMemoryBytes and maxMemoryPercent are mutually exclusive")),
            (Some(bytes), None) => Ok(Self { max_entries, max_bytes: Some(bytes), compression_threshold_bytes }),
            (None, Some(percent)) => Ok(Self::from_percent(max_entries, host_capacity_bytes, percent, compression_threshold_bytes)),
            (None, None) => Ok(Self { max_entries, max_bytes: None, compression_threshold_bytes }),
        }
    }
}

/// In-process LRU cache driver with a byte-budget eviction pass on top of
/// entry-count eviction, and gzip compression above `compression_threshold_bytes`.
pub struct MemoryCacheDriver {
    entries: Mutex<LruCache<String, StoredEntry>>,
    max_bytes: Option<u64>,
    compression_threshold: usize,
    total_bytes: AtomicU64,
    pressure_events: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl MemoryCacheDriver {
    pub fn new(config: MemoryDriverConfig) -> Self {
        Self::with_event_bus(config, None)
    }

    /// Same as [`MemoryCacheDriver::new`], but emits `plg:cache:pressure` on the
    /// given bus whenever a write has to evict to stay under `max_bytes` (§4.3,
    /// §8 "Memory cache reaching maxMemoryBytes: pressure event emitted").
    pub fn with_event_bus(config: MemoryDriverConfig, events: Option<Arc<EventBus>>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is never zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_bytes: config.max_bytes,
            compression_threshold: config.compression_threshold_bytes,
            total_bytes: AtomicU64::new(0),
            pressure_events: AtomicU64::new(0),
            events,
        }
    }

    pub fn pressure_event_count(&self) -> u64 {
        self.pressure_events.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    fn maybe_compress(&self, value: Vec<u8>) -> (Vec<u8>, bool) {
        if value.len() > self.compression_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&value).expect("writing to an in-memory buffer cannot fail");
            (encoder.finish().expect("finishing an in-memory gzip stream cannot fail"), true)
        } else {
            (value, false)
        }
    }

    /// Evicts least-recently-used entries until `total_bytes` is back under the
    /// configured cap, incrementing the pressure counter per eviction and
    /// emitting `plg:cache:pressure` once if any eviction happened.
    async fn evict_if_over_budget(&self) {
        let Some(max_bytes) = self.max_bytes else { return };
        let evicted_count = {
            let mut entries = self.entries.lock();
            let mut count = 0u64;
            while self.total_bytes.load(Ordering::SeqCst) > max_bytes {
                match entries.pop_lru() {
                    Some((_, evicted)) => {
                        self.total_bytes.fetch_sub(evicted.size, Ordering::SeqCst);
                        self.pressure_events.fetch_add(1, Ordering::SeqCst);
                        count += 1;
                    }
                    None => break,
                }
            }
            count
        };
        if evicted_count > 0 {
            if let Some(events) = &self.events {
                events
                    .emit(
                        &EventBus::plugin_event("cache", "pressure"),
                        serde_json::json!({ "evictedCount": evicted_count, "totalBytes": self.total_bytes.load(Ordering::SeqCst) }),
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl CacheDriver for MemoryCacheDriver {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let found = {
            let mut entries = self.entries.lock();
            entries.get(key).cloned()
        };
        match found {
            None => Ok(None),
            Some(entry) if !entry.compressed => Ok(Some(entry.bytes)),
            Some(entry) => {
                let mut decoder = GzDecoder::new(entry.bytes.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| EngineError::InvariantViolation { message: format!("corrupt compressed cache entry at {key}: {e}") })?;
                Ok(Some(out))
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        let (bytes, compressed) = self.maybe_compress(value);
        let size = bytes.len() as u64;
        {
            let mut entries = self.entries.lock();
            if let Some(old) = entries.put(key.to_string(), StoredEntry { bytes, compressed, size }) {
                self.total_bytes.fetch_sub(old.size, Ordering::SeqCst);
            }
        }
        self.total_bytes.fetch_add(size, Ordering::SeqCst);
        self.evict_if_over_budget().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.pop(key) {
            self.total_bytes.fetch_sub(old.size, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()> {
        let mut entries = self.entries.lock();
        let matching: Vec<String> = entries.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, _)| k.clone()).collect();
        for key in matching {
            if let Some(old) = entries.pop(&key) {
                self.total_bytes.fetch_sub(old.size, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn size(&self) -> EngineResult<usize> {
        Ok(self.entries.lock().len())
    }

    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        Ok(self.entries.lock().iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, _)| k.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_limits_rejects_both_bytes_and_percent() {
        let err = MemoryDriverConfig::from_raw_limits(100, Some(1024), Some(50.0), 4096, 256).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn from_raw_limits_resolves_percent_against_host_capacity() {
        let config = MemoryDriverConfig::from_raw_limits(100, None, Some(50.0), 1000, 256).unwrap();
        assert_eq!(config.max_bytes, Some(500));
    }

    #[tokio::test]
    async fn roundtrips_small_values_uncompressed() {
        let driver = MemoryCacheDriver::new(MemoryDriverConfig::default());
        driver.set("k", b"hello".to_vec()).await.unwrap();
        assert_eq!(driver.get("k").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn compresses_values_above_threshold_and_decompresses_on_read() {
        let driver = MemoryCacheDriver::new(MemoryDriverConfig { compression_threshold_bytes: 4, ..Default::default() });
        let value = b"a value longer than four bytes".to_vec();
        driver.set("k", value.clone()).await.unwrap();
        assert_eq!(driver.get("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn clear_prefix_removes_only_matching_keys() {
        let driver = MemoryCacheDriver::new(MemoryDriverConfig::default());
        driver.set("resource=a/x", vec![1]).await.unwrap();
        driver.set("resource=b/x", vec![2]).await.unwrap();
        driver.clear_prefix("resource=a/").await.unwrap();
        assert_eq!(driver.get("resource=a/x").await.unwrap(), None);
        assert_eq!(driver.get("resource=b/x").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn byte_budget_eviction_keeps_total_under_cap() {
        let driver = MemoryCacheDriver::new(MemoryDriverConfig { max_entries: 100, max_bytes: Some(10), compression_threshold_bytes: 1_000_000 });
        driver.set("a", vec![0u8; 6]).await.unwrap();
        driver.set("b", vec![0u8; 6]).await.unwrap();
        assert!(driver.total_bytes() <= 10);
        assert!(driver.pressure_event_count() >= 1);
    }

    #[tokio::test]
    async fn byte_budget_eviction_emits_a_pressure_event() {
        let events = Arc::new(EventBus::new());
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_clone = hits.clone();
        events.subscribe(
            EventBus::plugin_event("cache", "pressure"),
            Arc::new(move |_payload| {
                let hits = hits_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }),
        );
        let driver = MemoryCacheDriver::with_event_bus(
            MemoryDriverConfig { max_entries: 100, max_bytes: Some(10), compression_threshold_bytes: 1_000_000 },
            Some(events),
        );
        driver.set("a", vec![0u8; 6]).await.unwrap();
        driver.set("b", vec![0u8; 6]).await.unwrap();
        assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }
}
