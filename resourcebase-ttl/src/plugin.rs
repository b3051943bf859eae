use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resourcebase_core::{CallOptions, EngineError, EngineResult, InternalStore, MethodCall, ObjectStoreClient, Resource, ResourceEvent, ResourceMethod};
use resourcebase_plugin::PluginCore;
use serde_json::Value;
use tracing::{error, warn};

use crate::index::{entity_id, Granularity, TtlIndexEntry};
use crate::strategy::ExpireStrategy;

/// Per-resource TTL configuration. Exactly one of `ttl_seconds`/`field` must be
/// set per §4.4's validation rule:
/// - `ttl_seconds` set: `expiresAt = record[base_field] (or now) + ttl_seconds * 1000`.
/// - `field` set (and `ttl_seconds` unset): `record[field]` *is* the absolute expiry instant.
#[derive(Clone)]
pub struct ResourceTtlConfig {
    pub ttl_seconds: Option<u64>,
    pub field: Option<String>,
    pub base_field: String,
    pub strategy: ExpireStrategy,
}

impl ResourceTtlConfig {
    pub fn relative(ttl_seconds: u64) -> Self {
        Self { ttl_seconds: Some(ttl_seconds), field: None, base_field: DEFAULT_CREATED_AT_FIELD.into(), strategy: ExpireStrategy::default() }
    }

    pub fn absolute(field: impl Into<String>) -> Self {
        Self { ttl_seconds: None, field: Some(field.into()), base_field: DEFAULT_CREATED_AT_FIELD.into(), strategy: ExpireStrategy::default() }
    }

    pub fn with_base_field(mut self, base_field: impl Into<String>) -> Self {
        self.base_field = base_field.into();
        self
    }

    pub fn with_strategy(mut self, strategy: ExpireStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn validate(&self, resource_name: &str) -> EngineResult<()> {
        if self.ttl_seconds.is_none() && self.field.is_none() {
            return Err(EngineError::configuration_invalid("ttl", format!("resource '{resource_name}' must declare either ttl or field")));
        }
        if let ExpireStrategy::Archive { archive_resource, .. } = &self.strategy {
            if archive_resource.trim().is_empty() {
                return Err(EngineError::configuration_invalid("ttl", format!("resource '{resource_name}' uses the archive strategy but did not set archiveResource")));
            }
        }
        Ok(())
    }

    fn granularity(&self) -> Granularity {
        match self.ttl_seconds {
            Some(s) => Granularity::from_ttl_seconds(s),
            None => Granularity::Day,
        }
    }

    /// `base = record[base_field] ?? (base_field == "createdAt" ? now : null)`.
    /// A custom `base_field` absent from the record suppresses index creation
    /// entirely rather than silently falling back to `now` (§8).
    fn compute_expires_at(&self, record: &Value) -> Option<DateTime<Utc>> {
        match self.ttl_seconds {
            Some(ttl) => {
                let base = match record.get(&self.base_field).and_then(extract_millis) {
                    Some(millis) => millis,
                    None if self.base_field == DEFAULT_CREATED_AT_FIELD => Utc::now().timestamp_millis(),
                    None => return None,
                };
                DateTime::from_timestamp_millis(base + ttl as i64 * 1_000)
            }
            None => {
                let field = self.field.as_ref()?;
                record.get(field).and_then(extract_millis).and_then(DateTime::from_timestamp_millis)
            }
        }
    }
}

const DEFAULT_CREATED_AT_FIELD: &str = "createdAt";

fn extract_millis(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp_millis())
}

/// §4.4 counters: `{totalScans, totalExpired, totalDeleted, totalArchived,
/// totalSoftDeleted, totalCallbacks, totalErrors, lastScanAt, lastScanDuration}`.
/// `total_scans` counts sweep runs (one per cron tick per granularity);
/// `total_expired` counts index entries whose exact timestamp had elapsed,
/// broken down by the strategy that actually ran into the four `total_*` below.
#[derive(Debug, Default)]
pub struct TtlCounters {
    pub total_scans: AtomicU64,
    pub total_expired: AtomicU64,
    pub total_deleted: AtomicU64,
    pub total_archived: AtomicU64,
    pub total_soft_deleted: AtomicU64,
    pub total_callbacks: AtomicU64,
    pub total_errors: AtomicU64,
    last_scan_at_millis: AtomicU64,
    last_scan_duration_millis: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct TtlCountersSnapshot {
    pub total_scans: u64,
    pub total_expired: u64,
    pub total_deleted: u64,
    pub total_archived: u64,
    pub total_soft_deleted: u64,
    pub total_callbacks: u64,
    pub total_errors: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_scan_duration_ms: u64,
}

impl TtlCounters {
    fn record_scan(&self, started_at: DateTime<Utc>, duration: std::time::Duration) {
        self.total_scans.fetch_add(1, Ordering::Relaxed);
        self.last_scan_at_millis.store(started_at.timestamp_millis().max(0) as u64, Ordering::Relaxed);
        self.last_scan_duration_millis.store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TtlCountersSnapshot {
        let last_scan_at_millis = self.last_scan_at_millis.load(Ordering::Relaxed);
        TtlCountersSnapshot {
            total_scans: self.total_scans.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            total_deleted: self.total_deleted.load(Ordering::Relaxed),
            total_archived: self.total_archived.load(Ordering::Relaxed),
            total_soft_deleted: self.total_soft_deleted.load(Ordering::Relaxed),
            total_callbacks: self.total_callbacks.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            last_scan_at: (last_scan_at_millis > 0).then(|| DateTime::from_timestamp_millis(last_scan_at_millis as i64)).flatten(),
            last_scan_duration_ms: self.last_scan_duration_millis.load(Ordering::Relaxed),
        }
    }
}

/// C8: partition-indexed, granularity-bucketed TTL expiration. Every configured
/// resource's insert/update records an index entry keyed by expiry cohort; cron
/// sweepers scan the last K cohorts per granularity and dispatch the configured
/// [`ExpireStrategy`] for entries whose precise `expiresAtTimestamp` has elapsed.
/// Cohorts are an index only, the timestamp on the entry is the source of truth
/// for whether something has actually expired.
pub struct TtlPlugin {
    core: Arc<PluginCore>,
    index: InternalStore,
    configs: DashMap<String, ResourceTtlConfig>,
    resources: DashMap<String, Arc<dyn Resource>>,
    archive_resources: DashMap<String, Arc<dyn Resource>>,
    minute_lookback: u32,
    hour_lookback: u32,
    batch_size: usize,
    running: DashMap<&'static str, Arc<AtomicBool>>,
    counters: Arc<TtlCounters>,
}

impl TtlPlugin {
    pub fn new(core: Arc<PluginCore>, object_store: Arc<dyn ObjectStoreClient>, minute_lookback: u32, hour_lookback: u32, batch_size: usize) -> Self {
        let index = InternalStore::new(object_store, core.identity.resource_name("plg_ttl_expiration_index"));
        Self {
            core,
            index,
            configs: DashMap::new(),
            resources: DashMap::new(),
            archive_resources: DashMap::new(),
            minute_lookback,
            hour_lookback,
            batch_size,
            running: DashMap::new(),
            counters: Arc::new(TtlCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<TtlCounters> {
        self.counters.clone()
    }

    /// Stops every sweeper cron job this plugin registered.
    pub async fn teardown(&self) -> EngineResult<()> {
        self.core.teardown().await
    }

    /// Installs insert/update hooks that maintain the expiration index, and a
    /// delete hook that removes stale index entries for a record the host
    /// deleted directly (not through a sweep).
    pub fn configure_resource(&self, resource: &Arc<dyn Resource>, config: ResourceTtlConfig) -> EngineResult<()> {
        let resource_name = resource.name().to_string();
        config.validate(&resource_name)?;

        let index = self.index.clone();
        let cfg = config.clone();
        let name = resource_name.clone();
        resource.hooks().add_hook(
            ResourceEvent::AfterInsert,
            Arc::new(move |ctx, result| {
                let index = index.clone();
                let cfg = cfg.clone();
                let name = name.clone();
                let ctx = ctx.clone();
                let result = result.clone();
                Box::pin(async move { record_expiry(&index, &cfg, &name, &ctx, &result).await })
            }),
        );

        let index = self.index.clone();
        let cfg = config.clone();
        let name = resource_name.clone();
        resource.hooks().add_hook(
            ResourceEvent::AfterUpdate,
            Arc::new(move |ctx, result| {
                let index = index.clone();
                let cfg = cfg.clone();
                let name = name.clone();
                let ctx = ctx.clone();
                let result = result.clone();
                Box::pin(async move { record_expiry(&index, &cfg, &name, &ctx, &result).await })
            }),
        );

        let index = self.index.clone();
        let name = resource_name.clone();
        resource.hooks().add_hook(
            ResourceEvent::BeforeDelete,
            Arc::new(move |ctx, _result| {
                let index = index.clone();
                let name = name.clone();
                let id = ctx.id.clone();
                Box::pin(async move {
                    if let Some(id) = &id {
                        forget_expiry(&index, &name, id).await?;
                    }
                    Ok(())
                })
            }),
        );

        self.configs.insert(resource_name.clone(), config);
        self.resources.insert(resource_name, resource.clone());
        Ok(())
    }

    pub fn register_archive_resource(&self, resource_name: impl Into<String>, archive: Arc<dyn Resource>) {
        self.archive_resources.insert(resource_name.into(), archive);
    }

    /// Starts one cron sweeper per granularity actually in use among configured
    /// resources. Idempotent: calling twice just re-registers (callers should
    /// only call this once, typically from `on_start`).
    pub async fn start_sweepers(self: &Arc<Self>) -> EngineResult<()> {
        let mut granularities: Vec<Granularity> = self.configs.iter().map(|e| e.value().granularity()).collect();
        granularities.sort_by_key(granularity_rank);
        granularities.dedup_by_key(|g| granularity_rank(g));

        for granularity in granularities {
            let plugin = self.clone();
            let flag = Arc::new(AtomicBool::new(false));
            self.running.insert(granularity_label(&granularity), flag.clone());
            self.core
                .schedule_cron(
                    granularity.sweep_cron(),
                    Arc::new(move || {
                        let plugin = plugin.clone();
                        let flag = flag.clone();
                        Box::pin(async move {
                            if flag.swap(true, Ordering::SeqCst) {
                                return;
                            }
                            if let Err(e) = plugin.sweep(granularity).await {
                                error!(error = %e, granularity = granularity_label(&granularity), "ttl sweep failed");
                                plugin.core.emit("cleanup-error", serde_json::json!({"granularity": granularity_label(&granularity), "error": e.to_string()})).await;
                            }
                            flag.store(false, Ordering::SeqCst);
                        })
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn sweep(&self, granularity: Granularity) -> EngineResult<()> {
        let scan_started_at = Utc::now();
        let clock_start = std::time::Instant::now();
        let result = self.sweep_inner(granularity, scan_started_at).await;
        self.counters.record_scan(scan_started_at, clock_start.elapsed());
        result
    }

    async fn sweep_inner(&self, granularity: Granularity, now: DateTime<Utc>) -> EngineResult<()> {
        let lookback = match granularity {
            Granularity::Minute => self.minute_lookback,
            _ => self.hour_lookback,
        };
        let mut processed = 0usize;

        for cohort in granularity.recent_cohorts(now, lookback) {
            if processed >= self.batch_size {
                break;
            }
            let entries = self.index.list_in_index("byExpiresAtCohort", &cohort).await?;
            for (id, raw) in entries {
                if processed >= self.batch_size {
                    break;
                }
                let entry: TtlIndexEntry = match serde_json::from_value(raw) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(id, error = %e, "corrupt ttl index entry, skipping");
                        self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                if entry.expires_at_timestamp > now.timestamp_millis() {
                    continue;
                }
                processed += 1;
                let outcome = match self.expire_one(&entry).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(resource = %entry.resource_name, record = %entry.record_id, error = %e, "ttl expiry action failed");
                        self.counters.total_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                self.index.remove_index("byExpiresAtCohort", &entry.expires_at_cohort, &id).await?;
                self.index.delete(&id).await?;
                self.counters.total_expired.fetch_add(1, Ordering::Relaxed);
                match outcome {
                    ExpireOutcome::HardDeleted => self.counters.total_deleted.fetch_add(1, Ordering::Relaxed),
                    ExpireOutcome::SoftDeleted => self.counters.total_soft_deleted.fetch_add(1, Ordering::Relaxed),
                    ExpireOutcome::Archived => self.counters.total_archived.fetch_add(1, Ordering::Relaxed),
                    ExpireOutcome::CallbackRan => self.counters.total_callbacks.fetch_add(1, Ordering::Relaxed),
                };
            }
        }
        Ok(())
    }

    async fn expire_one(&self, entry: &TtlIndexEntry) -> EngineResult<ExpireOutcome> {
        let config = self
            .configs
            .get(&entry.resource_name)
            .ok_or_else(|| EngineError::configuration_invalid("ttl", format!("no ttl config for resource '{}'", entry.resource_name)))?
            .clone();
        let resource = self
            .resources
            .get(&entry.resource_name)
            .ok_or_else(|| EngineError::configuration_invalid("ttl", format!("resource '{}' is not registered", entry.resource_name)))?
            .clone();

        match &config.strategy {
            ExpireStrategy::HardDelete => {
                resource.delete(&entry.record_id, CallOptions::default()).await?;
                Ok(ExpireOutcome::HardDeleted)
            }
            ExpireStrategy::SoftDelete { deleted_at_field, isdeleted_field } => {
                let mut patch = HashMap::new();
                patch.insert(deleted_at_field.clone(), Value::String(Utc::now().to_rfc3339()));
                patch.insert(isdeleted_field.clone(), Value::String("true".to_string()));
                resource
                    .call(
                        ResourceMethod::Update,
                        MethodCall {
                            resource_name: entry.resource_name.clone(),
                            method: ResourceMethod::Update,
                            id: Some(entry.record_id.clone()),
                            args: serde_json::to_value(patch).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?,
                            options: CallOptions::default(),
                        },
                    )
                    .await?;
                Ok(ExpireOutcome::SoftDeleted)
            }
            ExpireStrategy::Archive { archive_resource, keep_original_id } => {
                let record = resource.get(&entry.record_id, CallOptions::default()).await?;
                let archive = self
                    .archive_resources
                    .get(archive_resource)
                    .ok_or_else(|| EngineError::RelatedResourceMissing { resource_name: archive_resource.clone() })?
                    .clone();
                let archived = build_archive_record(&record, &entry.resource_name, &entry.record_id, *keep_original_id);
                archive.insert(archived, CallOptions::default()).await?;
                resource.delete(&entry.record_id, CallOptions::default()).await?;
                Ok(ExpireOutcome::Archived)
            }
            ExpireStrategy::Callback(callback) => {
                let record = resource.get(&entry.record_id, CallOptions::default()).await.ok();
                if callback(&entry.record_id, record).await? {
                    resource.delete(&entry.record_id, CallOptions::default()).await?;
                }
                Ok(ExpireOutcome::CallbackRan)
            }
        }
    }
}

/// Which branch [`TtlPlugin::expire_one`] actually took, used only to attribute
/// the right `total_*` counter in [`TtlPlugin::sweep_inner`].
enum ExpireOutcome {
    HardDeleted,
    SoftDeleted,
    Archived,
    CallbackRan,
}

async fn record_expiry(index: &InternalStore, config: &ResourceTtlConfig, resource_name: &str, ctx: &MethodCall, result: &Value) -> EngineResult<()> {
    let id = result.get("id").and_then(Value::as_str).or(ctx.id.as_deref());
    let Some(id) = id else {
        return Ok(());
    };
    let Some(expires_at) = config.compute_expires_at(result) else {
        return Ok(());
    };
    let granularity = config.granularity();
    let entity = entity_id(resource_name, id);
    let entry = TtlIndexEntry::new(resource_name, id, expires_at, granularity);
    index.put_indexed(&entity, &serde_json::to_value(&entry).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?, "byExpiresAtCohort", &entry.expires_at_cohort).await
}

async fn forget_expiry(index: &InternalStore, resource_name: &str, id: &str) -> EngineResult<()> {
    let entity = entity_id(resource_name, id);
    if let Some(raw) = index.get(&entity).await? {
        if let Ok(entry) = serde_json::from_value::<TtlIndexEntry>(raw) {
            index.remove_index("byExpiresAtCohort", &entry.expires_at_cohort, &entity).await?;
        }
    }
    index.delete(&entity).await
}

/// Builds the record inserted into `archiveResource` for an expiring record: the
/// original's user-facing fields (those not prefixed with `_`, the internal
/// marker reserved for plugin/index bookkeeping) plus `{archivedAt, archivedFrom,
/// originalId}`. When `keep_original_id` is false the copy gets a fresh id so it
/// doesn't collide with anything already in the archive resource.
fn build_archive_record(record: &Value, resource_name: &str, record_id: &str, keep_original_id: bool) -> Value {
    let mut archived = match record.as_object() {
        Some(map) => map.iter().filter(|(k, _)| !k.starts_with('_')).map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => serde_json::Map::new(),
    };
    archived.insert("archivedAt".into(), Value::String(Utc::now().to_rfc3339()));
    archived.insert("archivedFrom".into(), Value::String(resource_name.to_string()));
    archived.insert("originalId".into(), Value::String(record_id.to_string()));
    if keep_original_id {
        archived.insert("id".into(), Value::String(record_id.to_string()));
    } else {
        archived.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
    }
    Value::Object(archived)
}

fn granularity_rank(g: &Granularity) -> u8 {
    match g {
        Granularity::Minute => 0,
        Granularity::Hour => 1,
        Granularity::Day => 2,
        Granularity::Week => 3,
    }
}

fn granularity_label(g: &Granularity) -> &'static str {
    match g {
        Granularity::Minute => "minute",
        Granularity::Hour => "hour",
        Granularity::Day => "day",
        Granularity::Week => "week",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resourcebase_core::{HandlerFn, HookRegistry, InMemoryObjectStore, MiddlewareChain, ResourceSchema};
    use resourcebase_plugin::{EventBus, PluginIdentity};
    use std::sync::Mutex as StdMutex;

    struct FakeResource {
        name: String,
        schema: ResourceSchema,
        middleware: MiddlewareChain,
        hooks: HookRegistry,
        records: Arc<StdMutex<HashMap<String, Value>>>,
    }

    impl FakeResource {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                schema: ResourceSchema { attributes: Value::Null, partitions: vec![], timestamps: true, created_by: resourcebase_core::resource::CreatedBy::User },
                middleware: MiddlewareChain::new(),
                hooks: HookRegistry::new(),
                records: Arc::new(StdMutex::new(HashMap::new())),
            })
        }

        fn seed(&self, id: &str, record: Value) {
            self.records.lock().unwrap().insert(id.to_string(), record);
        }
    }

    #[async_trait::async_trait]
    impl Resource for FakeResource {
        fn name(&self) -> &str {
            &self.name
        }
        fn schema(&self) -> &ResourceSchema {
            &self.schema
        }
        fn middleware(&self) -> &MiddlewareChain {
            &self.middleware
        }
        fn hooks(&self) -> &HookRegistry {
            &self.hooks
        }
        fn original_handler(&self, method: ResourceMethod) -> HandlerFn {
            let records = self.records.clone();
            resourcebase_core::resource::handler(move |ctx: MethodCall| {
                let records = records.clone();
                async move {
                    match method {
                        ResourceMethod::Get => {
                            let id = ctx.id.clone().unwrap_or_default();
                            records.lock().unwrap().get(&id).cloned().ok_or_else(|| resourcebase_core::resource::not_found("fake", &id))
                        }
                        ResourceMethod::Delete => {
                            let id = ctx.id.clone().unwrap_or_default();
                            records.lock().unwrap().remove(&id);
                            Ok(Value::Bool(true))
                        }
                        ResourceMethod::Insert => {
                            let id = ctx.args.get("id").and_then(Value::as_str).map(str::to_string).unwrap_or_default();
                            records.lock().unwrap().insert(id, ctx.args.clone());
                            Ok(ctx.args)
                        }
                        _ => Ok(Value::Null),
                    }
                }
            })
        }
    }

    fn make_core() -> Arc<PluginCore> {
        let object_store = InMemoryObjectStore::shared();
        let events = Arc::new(EventBus::new());
        let cron = Arc::new(NoopCron::default());
        Arc::new(PluginCore::new(PluginIdentity::new("ttl"), object_store, events, cron))
    }

    #[derive(Default)]
    struct NoopCron;
    #[async_trait::async_trait]
    impl resourcebase_plugin::CronScheduler for NoopCron {
        async fn schedule(&self, _expr: &str, _handler: resourcebase_plugin::CronHandler, _timezone: Option<&str>) -> EngineResult<uuid::Uuid> {
            Ok(uuid::Uuid::new_v4())
        }
        async fn stop(&self, _job_id: uuid::Uuid) -> EngineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn configure_resource_rejects_missing_ttl_and_field() {
        let core = make_core();
        let store = InMemoryObjectStore::shared();
        let plugin = TtlPlugin::new(core, store, 3, 2, 100);
        let resource = FakeResource::new("sessions");
        let bad = ResourceTtlConfig { ttl_seconds: None, field: None, base_field: "createdAt".into(), strategy: ExpireStrategy::default() };
        let err = plugin.configure_resource(&(resource as Arc<dyn Resource>), bad).unwrap_err();
        assert!(matches!(err, EngineError::ConfigurationInvalid { .. }));
    }

    #[tokio::test]
    async fn insert_hook_indexes_and_sweep_hard_deletes_expired_entry() {
        let core = make_core();
        let store = InMemoryObjectStore::shared();
        let plugin = Arc::new(TtlPlugin::new(core, store, 3, 2, 100));
        let resource = FakeResource::new("sessions");
        resource.seed("s1", serde_json::json!({"id": "s1", "createdAt": 0}));
        let resource_dyn: Arc<dyn Resource> = resource.clone();
        plugin.configure_resource(&resource_dyn, ResourceTtlConfig::relative(1)).unwrap();

        let ctx = MethodCall { resource_name: "sessions".into(), method: ResourceMethod::Insert, id: Some("s1".into()), args: Value::Null, options: CallOptions::default() };
        resource_dyn.hooks().fire(ResourceEvent::AfterInsert, &ctx, &serde_json::json!({"id": "s1", "createdAt": 0})).await.unwrap();

        plugin.sweep(Granularity::Minute).await.unwrap();
        assert!(resource.records.lock().unwrap().get("s1").is_none());
        let snapshot = plugin.counters.snapshot();
        assert_eq!(snapshot.total_expired, 1);
        assert_eq!(snapshot.total_deleted, 1);
        assert_eq!(snapshot.total_errors, 0);
        assert_eq!(snapshot.total_scans, 1);
        assert!(snapshot.last_scan_at.is_some());
    }

    #[tokio::test]
    async fn archive_strategy_copies_user_fields_and_strips_internal_ones() {
        let core = make_core();
        let store = InMemoryObjectStore::shared();
        let plugin = Arc::new(TtlPlugin::new(core, store, 3, 2, 100));
        let resource = FakeResource::new("orders");
        resource.seed("o7", serde_json::json!({"id": "o7", "createdAt": 0, "status": "done", "_internalRev": 4}));
        let resource_dyn: Arc<dyn Resource> = resource.clone();
        let archive = FakeResource::new("archive_orders");
        let archive_dyn: Arc<dyn Resource> = archive.clone();
        plugin.register_archive_resource("archive_orders", archive_dyn.clone());
        plugin
            .configure_resource(&resource_dyn, ResourceTtlConfig::relative(1).with_strategy(ExpireStrategy::Archive { archive_resource: "archive_orders".into(), keep_original_id: false }))
            .unwrap();

        let ctx = MethodCall { resource_name: "orders".into(), method: ResourceMethod::Insert, id: Some("o7".into()), args: Value::Null, options: CallOptions::default() };
        resource_dyn.hooks().fire(ResourceEvent::AfterInsert, &ctx, &serde_json::json!({"id": "o7", "createdAt": 0, "status": "done", "_internalRev": 4})).await.unwrap();

        plugin.sweep(Granularity::Minute).await.unwrap();

        assert!(resource.records.lock().unwrap().get("o7").is_none());
        let archived_records = archive.records.lock().unwrap();
        assert_eq!(archived_records.len(), 1);
        let archived = archived_records.values().next().unwrap();
        assert_eq!(archived.get("status").and_then(Value::as_str), Some("done"));
        assert_eq!(archived.get("archivedFrom").and_then(Value::as_str), Some("orders"));
        assert_eq!(archived.get("originalId").and_then(Value::as_str), Some("o7"));
        assert!(archived.get("archivedAt").is_some());
        assert!(archived.get("_internalRev").is_none());
        assert_ne!(archived.get("id").and_then(Value::as_str), Some("o7"));
    }

    #[tokio::test]
    async fn before_delete_hook_forgets_the_index_entry() {
        let core = make_core();
        let store = InMemoryObjectStore::shared();
        let plugin = Arc::new(TtlPlugin::new(core, store, 3, 2, 100));
        let resource = FakeResource::new("sessions");
        resource.seed("s1", serde_json::json!({"id": "s1", "createdAt": 0}));
        let resource_dyn: Arc<dyn Resource> = resource.clone();
        plugin.configure_resource(&resource_dyn, ResourceTtlConfig::relative(3600)).unwrap();

        let ctx = MethodCall { resource_name: "sessions".into(), method: ResourceMethod::Insert, id: Some("s1".into()), args: Value::Null, options: CallOptions::default() };
        resource_dyn.hooks().fire(ResourceEvent::AfterInsert, &ctx, &serde_json::json!({"id": "s1", "createdAt": 0})).await.unwrap();

        let delete_ctx = MethodCall { resource_name: "sessions".into(), method: ResourceMethod::Delete, id: Some("s1".into()), args: Value::Null, options: CallOptions::default() };
        resource_dyn.hooks().fire(ResourceEvent::BeforeDelete, &delete_ctx, &Value::Null).await.unwrap();

        let entries = plugin.index.list_in_index("byExpiresAtCohort", &Granularity::Hour.cohort(DateTime::from_timestamp_millis(3_600_000).unwrap())).await.unwrap();
        assert!(entries.is_empty());
    }
}
