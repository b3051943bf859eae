use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use resourcebase_core::error::{EngineError, LockError, ObjectStoreError};
use resourcebase_core::{EngineResult, ObjectStoreClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// C2: namespaced key/value storage for one plugin, all keys prefixed `plg/<slug>/`.
pub struct PluginStorage {
    store: Arc<dyn ObjectStoreClient>,
    slug: String,
}

impl PluginStorage {
    pub fn new(store: Arc<dyn ObjectStoreClient>, slug: impl Into<String>) -> Self {
        Self { store, slug: slug.into() }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    fn key(&self, key: &str) -> String {
        format!("plg/{}/{}", self.slug, key)
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        match self.store.get_object(&self.key(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                EngineError::InvariantViolation { message: format!("corrupt plugin storage value at {key}: {e}") }
            })?)),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> EngineResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| EngineError::InvariantViolation { message: format!("cannot serialize value for {key}: {e}") })?;
        self.store.put_object(&self.key(key), bytes).await.map_err(Into::into)
    }

    pub async fn delete(&self, key: &str) -> EngineResult<()> {
        match self.store.delete_object(&self.key(key)).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists keys relative to this plugin's namespace (the `plg/<slug>/` prefix stripped).
    pub async fn list(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let full_prefix = self.key(prefix);
        let keys = self.store.list_objects(&full_prefix).await?;
        let strip = format!("plg/{}/", self.slug);
        Ok(keys.into_iter().map(|k| k.trim_start_matches(&strip).to_string()).collect())
    }

    /// Deletes every key under this plugin's namespace. Used by `uninstall({purgeData: true})`.
    pub async fn purge(&self) -> EngineResult<()> {
        for key in self.list("").await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    pub fn lock(&self) -> DistributedLock {
        DistributedLock::new(self.store.clone(), self.slug.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    acquired_at_ms: i64,
    ttl_seconds: u64,
}

impl LockRecord {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms - self.acquired_at_ms > (self.ttl_seconds as i64) * 1000
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub ttl_seconds: u64,
    pub timeout_ms: u64,
    pub owner_id: Option<String>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self { ttl_seconds: 30, timeout_ms: 5_000, owner_id: None }
    }
}

/// A held lock; release it explicitly or let it expire by TTL if the holder crashes.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub name: String,
    pub owner: String,
}

/// Distributed lock built on the object store's conditional-create semantics. First
/// writer wins; no fairness guarantee across contending callers.
pub struct DistributedLock {
    store: Arc<dyn ObjectStoreClient>,
    slug: String,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn ObjectStoreClient>, slug: impl Into<String>) -> Self {
        Self { store, slug: slug.into() }
    }

    fn lock_key(&self, name: &str) -> String {
        format!("plg/{}/locks/{}", self.slug, name)
    }

    pub async fn acquire(&self, name: &str, opts: LockOptions) -> EngineResult<Option<LockHandle>> {
        let owner = opts.owner_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = self.lock_key(name);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(opts.timeout_ms);

        loop {
            let record = LockRecord { owner: owner.clone(), acquired_at_ms: Utc::now().timestamp_millis(), ttl_seconds: opts.ttl_seconds };
            let bytes = serde_json::to_vec(&record).expect("LockRecord always serializes");

            match self.store.put_object_if_absent(&key, bytes).await {
                Ok(()) => {
                    debug!(lock = name, owner = %owner, "lock acquired");
                    return Ok(Some(LockHandle { name: name.to_string(), owner }));
                }
                Err(ObjectStoreError::PreconditionFailed { .. }) => {
                    if self.try_preempt_expired(&key).await? {
                        continue; // retry the conditional create immediately
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(lock = name, "lock acquisition timed out");
                return Ok(None);
            }
            tokio::time::sleep(jittered_poll_interval()).await;
        }
    }

    /// Returns Ok(true) if an expired lock was removed and the caller should retry.
    async fn try_preempt_expired(&self, key: &str) -> EngineResult<bool> {
        let existing = match self.store.get_object(key).await {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound { .. }) => return Ok(true), // raced with a concurrent release
            Err(e) => return Err(e.into()),
        };
        let record: LockRecord = match serde_json::from_slice(&existing) {
            Ok(r) => r,
            Err(_) => return Ok(false), // corrupt record, don't preempt blindly
        };
        if record.is_expired(Utc::now().timestamp_millis()) {
            match self.store.delete_object(key).await {
                Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(true),
                Err(e) => Err(e.into()),
            }
        } else {
            Ok(false)
        }
    }

    pub async fn release(&self, handle: &LockHandle) -> EngineResult<()> {
        let key = self.lock_key(&handle.name);
        let existing = match self.store.get_object(&key).await {
            Ok(bytes) => bytes,
            Err(ObjectStoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let record: LockRecord = serde_json::from_slice(&existing)
            .map_err(|e| EngineError::InvariantViolation { message: format!("corrupt lock record: {e}") })?;
        if record.owner != handle.owner {
            return Err(LockError::NotOwner { name: handle.name.clone(), owner: handle.owner.clone() }.into());
        }
        match self.store.delete_object(&key).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn jittered_poll_interval() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(25..=75))
}

#[cfg(test)]
mod tests {
    use super::*;
    use resourcebase_core::InMemoryObjectStore;

    #[tokio::test]
    async fn second_acquire_waits_then_times_out() {
        let store = InMemoryObjectStore::shared();
        let lock = DistributedLock::new(store, "cache");
        let first = lock.acquire("sess", LockOptions { ttl_seconds: 60, timeout_ms: 50, owner_id: Some("a".into()) }).await.unwrap();
        assert!(first.is_some());
        let second = lock.acquire("sess", LockOptions { ttl_seconds: 60, timeout_ms: 50, owner_id: Some("b".into()) }).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_then_acquire_succeeds_immediately() {
        let store = InMemoryObjectStore::shared();
        let lock = DistributedLock::new(store, "cache");
        let handle = lock.acquire("sess", LockOptions { ttl_seconds: 60, timeout_ms: 50, owner_id: Some("a".into()) }).await.unwrap().unwrap();
        lock.release(&handle).await.unwrap();
        let second = lock.acquire("sess", LockOptions { ttl_seconds: 60, timeout_ms: 50, owner_id: Some("b".into()) }).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_preempted() {
        let store = InMemoryObjectStore::shared();
        let lock = DistributedLock::new(store, "cache");
        let _first = lock.acquire("sess", LockOptions { ttl_seconds: 0, timeout_ms: 50, owner_id: Some("a".into()) }).await.unwrap().unwrap();
        // ttl_seconds=0 means it is immediately considered expired on the next check.
        let second = lock.acquire("sess", LockOptions { ttl_seconds: 60, timeout_ms: 200, owner_id: Some("b".into()) }).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn plugin_storage_roundtrips_and_lists_relative_keys() {
        let store = InMemoryObjectStore::shared();
        let storage = PluginStorage::new(store, "cache");
        storage.set("cfg", &serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(storage.get("cfg").await.unwrap(), Some(serde_json::json!({"a": 1})));
        let keys = storage.list("").await.unwrap();
        assert_eq!(keys, vec!["cfg".to_string()]);
        storage.purge().await.unwrap();
        assert_eq!(storage.get("cfg").await.unwrap(), None);
    }
}
