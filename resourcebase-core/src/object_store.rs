use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ObjectStoreError;

/// C1: the abstract object-store contract every engine persists through.
///
/// This is deliberately the only boundary the rest of the workspace needs; an S3
/// wire client is a non-goal here and is expected to be a thin adapter implementing
/// this trait in the host application.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;

    /// Conditional create: fails with `PreconditionFailed` if the key already exists.
    /// Distributed locking correctness depends on this being a true atomic check.
    async fn put_object_if_absent(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn head_object(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Modeled as already fully paginated: returns every key under `prefix`. A real
    /// S3-backed implementation is expected to loop continuation tokens internally.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

/// In-memory test double used by the workspace's own test suites and suitable as a
/// reference implementation for embedders without a real object store handy.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self { objects: DashMap::new() }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn put_object_if_absent(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStoreError> {
        match self.objects.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ObjectStoreError::PreconditionFailed { key: key.to_string() })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(body);
                Ok(())
            }
        }
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| ObjectStoreError::NotFound { key: key.to_string() })
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| ObjectStoreError::NotFound { key: key.to_string() })
    }

    async fn head_object(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.objects.contains_key(key))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        // BTreeMap snapshot gives deterministic ordering, useful for tests asserting on sweep order.
        let matched: BTreeMap<String, ()> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), ()))
            .collect();
        Ok(matched.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_rejects_second_writer() {
        let store = InMemoryObjectStore::new();
        store.put_object_if_absent("k", b"a".to_vec()).await.unwrap();
        let err = store.put_object_if_absent("k", b"b".to_vec()).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn list_objects_is_prefix_filtered_and_sorted() {
        let store = InMemoryObjectStore::new();
        store.put_object("plg/cache/b", vec![]).await.unwrap();
        store.put_object("plg/cache/a", vec![]).await.unwrap();
        store.put_object("plg/ttl/a", vec![]).await.unwrap();
        let keys = store.list_objects("plg/cache/").await.unwrap();
        assert_eq!(keys, vec!["plg/cache/a".to_string(), "plg/cache/b".to_string()]);
    }

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let store = InMemoryObjectStore::new();
        let err = store.get_object("missing").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));
    }
}
