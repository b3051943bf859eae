use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, ObjectStoreError};
use crate::object_store::ObjectStoreClient;
use crate::EngineResult;

/// A keyed store with at most one secondary index, built directly on the object
/// store rather than the full [`crate::resource::Resource`]/middleware contract.
///
/// Plugins own internal bookkeeping resources (the TTL expiration index, the
/// state machine's state store and transition log) that nothing else composes
/// middleware onto; routing them through the generic method-dispatch machinery
/// built for host-facing resources would be ceremony with no payoff, so they are
/// built on this narrower primitive instead. Records are opaque JSON; the single
/// secondary index is a prefix-scannable `(index_name, index_value) -> id` marker
/// set, sufficient for the TTL index's `byExpiresAtCohort` partition and the
/// state machine's by-machine/by-date transition log partitions.
#[derive(Clone)]
pub struct InternalStore {
    store: Arc<dyn ObjectStoreClient>,
    resource_name: String,
}

impl InternalStore {
    pub fn new(store: Arc<dyn ObjectStoreClient>, resource_name: impl Into<String>) -> Self {
        Self { store, resource_name: resource_name.into() }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn record_key(&self, id: &str) -> String {
        format!("res/{}/records/{}.json", self.resource_name, id)
    }

    fn index_key(&self, index_name: &str, index_value: &str, id: &str) -> String {
        format!("res/{}/index/{}/{}/{}", self.resource_name, index_name, index_value, id)
    }

    fn index_prefix(&self, index_name: &str, index_value: &str) -> String {
        format!("res/{}/index/{}/{}/", self.resource_name, index_name, index_value)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Option<Value>> {
        match self.store.get_object(&self.record_key(id)).await {
            Ok(bytes) => Ok(Some(decode(id, &bytes)?)),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a record with no secondary index entry.
    pub async fn put(&self, id: &str, record: &Value) -> EngineResult<()> {
        self.store.put_object(&self.record_key(id), encode(record)?).await.map_err(Into::into)
    }

    /// Writes a record and an index marker. Callers that move a record between
    /// index buckets (e.g. the TTL index when a record's expiry field changes)
    /// must call [`InternalStore::remove_index`] for the stale bucket themselves.
    pub async fn put_indexed(&self, id: &str, record: &Value, index_name: &str, index_value: &str) -> EngineResult<()> {
        self.put(id, record).await?;
        self.store.put_object(&self.index_key(index_name, index_value, id), Vec::new()).await.map_err(Into::into)
    }

    /// Writes a record with more than one secondary index marker, e.g. the state
    /// machine's transition log needs both a `byMachine` and a `byDate` partition
    /// on the same entry.
    pub async fn put_indexed_multi(&self, id: &str, record: &Value, indices: &[(&str, &str)]) -> EngineResult<()> {
        self.put(id, record).await?;
        for (index_name, index_value) in indices {
            self.store.put_object(&self.index_key(index_name, index_value, id), Vec::new()).await?;
        }
        Ok(())
    }

    pub async fn remove_index(&self, index_name: &str, index_value: &str, id: &str) -> EngineResult<()> {
        match self.store.delete_object(&self.index_key(index_name, index_value, id)).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        match self.store.delete_object(&self.record_key(id)).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the ids registered under `(index_name, index_value)`, without
    /// fetching their records.
    pub async fn list_ids_in_index(&self, index_name: &str, index_value: &str) -> EngineResult<Vec<String>> {
        let prefix = self.index_prefix(index_name, index_value);
        let keys = self.store.list_objects(&prefix).await?;
        Ok(keys.into_iter().map(|k| k.trim_start_matches(&prefix).to_string()).collect())
    }

    /// Fetches every record registered under `(index_name, index_value)`,
    /// silently skipping ids whose record has since been deleted (a marker can
    /// outlive its record if a caller removes the record without clearing the
    /// index, which the TTL/state-machine engines never do but test doubles
    /// might).
    pub async fn list_in_index(&self, index_name: &str, index_value: &str) -> EngineResult<Vec<(String, Value)>> {
        let ids = self.list_ids_in_index(index_name, index_value).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                out.push((id, record));
            }
        }
        Ok(out)
    }

    pub async fn list_all(&self) -> EngineResult<Vec<(String, Value)>> {
        let prefix = format!("res/{}/records/", self.resource_name);
        let keys = self.store.list_objects(&prefix).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.store.get_object(&key).await?;
            let id = key.trim_start_matches(&prefix).trim_end_matches(".json").to_string();
            out.push((id.clone(), decode(&id, &bytes)?));
        }
        Ok(out)
    }
}

fn encode(value: &Value) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| EngineError::InvariantViolation { message: format!("cannot serialize internal record: {e}") })
}

fn decode(id: &str, bytes: &[u8]) -> EngineResult<Value> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::InvariantViolation { message: format!("corrupt internal record {id}: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;

    #[tokio::test]
    async fn put_indexed_then_list_in_index_roundtrips() {
        let store = InternalStore::new(InMemoryObjectStore::shared(), "plg_ttl_expiration_index");
        store.put_indexed("sessions:s1", &serde_json::json!({"recordId": "s1"}), "byExpiresAtCohort", "2026-07-27T12:00").await.unwrap();
        let entries = store.list_in_index("byExpiresAtCohort", "2026-07-27T12:00").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "sessions:s1");
    }

    #[tokio::test]
    async fn delete_removes_the_record_but_not_a_stale_index_marker() {
        let store = InternalStore::new(InMemoryObjectStore::shared(), "plg_ttl_expiration_index");
        store.put_indexed("sessions:s1", &serde_json::json!({}), "byExpiresAtCohort", "c1").await.unwrap();
        store.delete("sessions:s1").await.unwrap();
        assert_eq!(store.get("sessions:s1").await.unwrap(), None);
        // index marker is orphaned until the caller also calls remove_index; list_in_index skips it.
        let entries = store.list_in_index("byExpiresAtCohort", "c1").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn remove_index_is_idempotent_on_an_already_removed_marker() {
        let store = InternalStore::new(InMemoryObjectStore::shared(), "plg_state_entities");
        store.remove_index("byMachine", "order", "order_o1").await.unwrap();
    }
}
