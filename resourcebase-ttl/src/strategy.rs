use std::sync::Arc;

use resourcebase_core::EngineResult;
use serde_json::Value;

/// Invoked by [`ExpireStrategy::Callback`] with the expiring record's id and
/// last-known body (`None` if the record was already gone by sweep time). A
/// truthy return tells the engine to proceed with a hard-delete of the record;
/// the callback itself never deletes or modifies anything.
pub type ExpireCallback = Arc<dyn Fn(&str, Option<Value>) -> futures::future::BoxFuture<'static, EngineResult<bool>> + Send + Sync>;

/// What happens to a record once its TTL has elapsed, per §4.4.
#[derive(Clone)]
pub enum ExpireStrategy {
    /// Sets a `deletedAt` timestamp and an `isdeleted` marker on the record and
    /// leaves it in place, per §4.4 (`{deleteField: isoNow, isdeleted: "true"}`).
    SoftDelete { deleted_at_field: String, isdeleted_field: String },
    /// Removes the record outright.
    HardDelete,
    /// Copies the record into an archive resource, then hard-deletes the original.
    /// `keep_original_id` controls whether the archived copy reuses the source
    /// record's id or is assigned a fresh one.
    Archive { archive_resource: String, keep_original_id: bool },
    /// Hands the record to caller-supplied logic; the engine does not delete
    /// or modify anything itself, the callback owns that decision.
    Callback(ExpireCallback),
}

impl std::fmt::Debug for ExpireStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpireStrategy::SoftDelete { deleted_at_field, isdeleted_field } => {
                f.debug_struct("SoftDelete").field("deleted_at_field", deleted_at_field).field("isdeleted_field", isdeleted_field).finish()
            }
            ExpireStrategy::HardDelete => write!(f, "HardDelete"),
            ExpireStrategy::Archive { archive_resource, keep_original_id } => {
                f.debug_struct("Archive").field("archive_resource", archive_resource).field("keep_original_id", keep_original_id).finish()
            }
            ExpireStrategy::Callback(_) => write!(f, "Callback(..)"),
        }
    }
}

impl Default for ExpireStrategy {
    fn default() -> Self {
        ExpireStrategy::HardDelete
    }
}
