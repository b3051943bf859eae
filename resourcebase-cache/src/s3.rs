use std::sync::Arc;

use async_trait::async_trait;
use resourcebase_core::error::ObjectStoreError;
use resourcebase_core::{EngineResult, ObjectStoreClient};

use crate::driver::CacheDriver;

/// Cache driver backed directly by the same object store the resources persist
/// through. Keys are namespaced under `cache/` so they never collide with
/// resource data.
pub struct S3CacheDriver {
    store: Arc<dyn ObjectStoreClient>,
    prefix: String,
}

impl S3CacheDriver {
    pub fn new(store: Arc<dyn ObjectStoreClient>) -> Self {
        Self { store, prefix: "cache/".to_string() }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheDriver for S3CacheDriver {
    async fn get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        match self.store.get_object(&self.full_key(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> EngineResult<()> {
        self.store.put_object(&self.full_key(key), value).await.map_err(Into::into)
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        match self.store.delete_object(&self.full_key(key)).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> EngineResult<()> {
        let keys = self.store.list_objects(&self.full_key(prefix)).await?;
        for key in keys {
            match self.store.delete_object(&key).await {
                Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn size(&self) -> EngineResult<usize> {
        Ok(self.store.list_objects(&self.prefix).await?.len())
    }

    async fn keys(&self, prefix: &str) -> EngineResult<Vec<String>> {
        let stripped_prefix_len = self.prefix.len();
        Ok(self
            .store
            .list_objects(&self.full_key(prefix))
            .await?
            .into_iter()
            .map(|k| k[stripped_prefix_len..].to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resourcebase_core::InMemoryObjectStore;

    #[tokio::test]
    async fn roundtrips_through_object_store_namespace() {
        let store = InMemoryObjectStore::shared();
        let driver = S3CacheDriver::new(store);
        driver.set("resource=a/action=get/h.json.gz", b"v".to_vec()).await.unwrap();
        assert_eq!(driver.get("resource=a/action=get/h.json.gz").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn clear_prefix_only_touches_matching_keys() {
        let store = InMemoryObjectStore::shared();
        let driver = S3CacheDriver::new(store);
        driver.set("resource=a/x", vec![1]).await.unwrap();
        driver.set("resource=b/x", vec![2]).await.unwrap();
        driver.clear_prefix("resource=a/").await.unwrap();
        assert_eq!(driver.get("resource=a/x").await.unwrap(), None);
        assert_eq!(driver.get("resource=b/x").await.unwrap(), Some(vec![2]));
    }
}
