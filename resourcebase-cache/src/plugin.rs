use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use resourcebase_core::error::ObjectStoreError;
use resourcebase_core::resource::{CallOptions, MethodCall, Middleware, PartitionDef, Resource, ResourceMethod};
use resourcebase_core::{retry_with_backoff, EngineError, EngineResult, HandlerFn, RetryPolicy};
use resourcebase_plugin::PluginCore;
use serde_json::Value;
use tracing::warn;

use crate::driver::CacheDriverKind;
use crate::key::{self, derive_cache_key};
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// Filters which resources a [`CachePlugin`] installs middleware on.
///
/// `{include?, exclude?, !isPluginCreated unless includeOverride}`: by default,
/// resources created by another plugin are skipped so caches don't shadow
/// another plugin's own internal bookkeeping resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub include_plugin_created: bool,
}

impl ResourceFilter {
    pub fn matches(&self, resource: &dyn Resource) -> bool {
        let name = resource.name();
        if let Some(include) = &self.include {
            if !include.iter().any(|n| n == name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.iter().any(|n| n == name) {
                return false;
            }
        }
        if !self.include_plugin_created {
            use resourcebase_core::resource::CreatedBy;
            if matches!(resource.schema().created_by, CreatedBy::Plugin) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub filter: ResourceFilter,
    pub include_partitions: bool,
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { filter: ResourceFilter::default(), include_partitions: true, retry: RetryPolicy::default() }
    }
}

/// Per-resource read-through middleware: `driver.get` on a deterministic key,
/// falling through to `next()` on a miss and storing the result.
struct CacheReadMiddleware {
    driver: CacheDriverKind,
    stats: Arc<CacheStats>,
}

#[async_trait]
impl Middleware for CacheReadMiddleware {
    async fn call(&self, ctx: MethodCall, next: HandlerFn) -> EngineResult<Value> {
        if ctx.options.skip_cache {
            return next(ctx).await;
        }
        let cache_key = derive_cache_key(
            &ctx.resource_name,
            ctx.method,
            ctx.id.as_deref(),
            ctx.options.partition.as_deref(),
            &ctx.options.partition_values,
            &ctx.args,
        );

        match self.driver.get(&cache_key).await {
            Ok(Some(bytes)) => {
                self.stats.record_hit();
                serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::InvariantViolation { message: format!("corrupt cache entry at {cache_key}: {e}") })
            }
            Ok(None) => {
                self.stats.record_miss();
                let result = next(ctx).await?;
                let bytes = serde_json::to_vec(&result)
                    .map_err(|e| EngineError::InvariantViolation { message: format!("cannot serialize cache value: {e}") })?;
                if let Err(e) = self.driver.set(&cache_key, bytes).await {
                    self.stats.record_error();
                    warn!(key = %cache_key, error = %e, "failed to populate cache after miss");
                } else {
                    self.stats.record_write();
                }
                Ok(result)
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }
}

/// Per-resource invalidation middleware, run after a write succeeds.
struct CacheInvalidateMiddleware {
    driver: CacheDriverKind,
    stats: Arc<CacheStats>,
    config: CacheConfig,
    partitions: Vec<PartitionDef>,
    core: Arc<PluginCore>,
}

impl CacheInvalidateMiddleware {
    async fn clear_with_retry(&self, prefix: &str) -> EngineResult<()> {
        let result = retry_with_backoff(&self.config.retry, || {
            let driver = self.driver.clone();
            let prefix = prefix.to_string();
            async move {
                match driver.clear_prefix(&prefix).await {
                    Ok(()) => Ok(()),
                    Err(EngineError::ObjectStore(ObjectStoreError::NotFound { .. })) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        })
        .await;

        if let Err(e) = &result {
            self.stats.record_error();
            self.core.emit("clear-error", serde_json::json!({ "prefix": prefix, "error": e.to_string() })).await;
        }
        result
    }

    /// Clears the exact key each of `{get, exists, content, hasContent}` would
    /// have used for a param-less read of `id` — the common case for those four
    /// actions. Deleting the precise key rather than a broadened prefix avoids
    /// evicting other ids' entries for the same action.
    async fn clear_item_keys(&self, resource_name: &str, id: &str) {
        for method in [ResourceMethod::Get, ResourceMethod::Exists, ResourceMethod::Content, ResourceMethod::HasContent] {
            let exact_key = derive_cache_key(resource_name, method, Some(id), None, &HashMap::new(), &Value::Null);
            if let Err(e) = self.clear_with_retry(&exact_key).await {
                warn!(resource = resource_name, id, error = %e, "item-key cache clear failed");
            }
        }
    }

    async fn clear_partitions(&self, resource_name: &str, record: &Value) {
        if !self.config.include_partitions || self.partitions.is_empty() {
            return;
        }
        for partition in &self.partitions {
            let mut values = Vec::new();
            let mut all_null = true;
            for field in &partition.fields {
                let value = record.get(field).cloned().unwrap_or(Value::Null);
                if !value.is_null() {
                    all_null = false;
                }
                values.push((field.clone(), value));
            }
            if all_null {
                continue;
            }
            let prefix = key::partition_prefix(resource_name, &partition.name, &values);
            if let Err(e) = self.clear_with_retry(&format!("{prefix}/")).await {
                warn!(resource = resource_name, partition = partition.name, error = %e, "partition cache clear failed");
            }
        }
    }

    async fn clear_aggregates_fallback(&self, resource_name: &str) {
        for method in [ResourceMethod::Count, ResourceMethod::List, ResourceMethod::ListIds, ResourceMethod::GetAll, ResourceMethod::Page, ResourceMethod::Query] {
            let prefix = format!("{}action={}/", key::resource_prefix(resource_name), method.name());
            if let Err(e) = self.clear_with_retry(&prefix).await {
                warn!(resource = resource_name, method = %method, error = %e, "aggregate cache clear failed");
            }
        }
    }
}

#[async_trait]
impl Middleware for CacheInvalidateMiddleware {
    async fn call(&self, ctx: MethodCall, next: HandlerFn) -> EngineResult<Value> {
        let resource_name = ctx.resource_name.clone();
        let id = ctx.id.clone();
        let args = ctx.args.clone();
        let result = next(ctx).await?;

        if let Some(id) = &id {
            self.clear_item_keys(&resource_name, id).await;
        }
        let record_for_partitions = if result.is_object() { &result } else { &args };
        self.clear_partitions(&resource_name, record_for_partitions).await;

        let broad_prefix = key::resource_prefix(&resource_name);
        if self.clear_with_retry(&broad_prefix).await.is_err() {
            self.clear_aggregates_fallback(&resource_name).await;
        }

        Ok(result)
    }
}

/// The explicit escape-hatch vocabulary standing in for the source's proxy-based
/// cache namespace (REDESIGN FLAGS §9): every operation a caller might want from
/// "the cache for this resource" without reaching into driver internals.
pub struct CacheNamespace {
    resource_name: String,
    driver: CacheDriverKind,
    stats: Arc<CacheStats>,
}

impl CacheNamespace {
    pub fn key_for(&self, method: ResourceMethod, id: Option<&str>, options: &CallOptions, params: &Value) -> String {
        derive_cache_key(&self.resource_name, method, id, options.partition.as_deref(), &options.partition_values, params)
    }

    pub async fn warm_item(&self, id: &str, value: &Value) -> EngineResult<()> {
        let key = self.key_for(ResourceMethod::Get, Some(id), &CallOptions::default(), &Value::Null);
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        self.driver.set(&key, bytes).await
    }

    pub async fn warm_many(&self, items: &[(String, Value)]) -> EngineResult<()> {
        for (id, value) in items {
            self.warm_item(id, value).await?;
        }
        Ok(())
    }

    pub async fn warm_list(&self, options: &CallOptions, value: &Value) -> EngineResult<()> {
        self.warm_aggregate(ResourceMethod::List, options, value).await
    }

    pub async fn warm_page(&self, options: &CallOptions, params: &Value, value: &Value) -> EngineResult<()> {
        let key = self.key_for(ResourceMethod::Page, None, options, params);
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        self.driver.set(&key, bytes).await
    }

    pub async fn warm_query(&self, options: &CallOptions, filter: &Value, value: &Value) -> EngineResult<()> {
        self.warm_aggregate_with_params(ResourceMethod::Query, options, filter, value).await
    }

    pub async fn warm_count(&self, options: &CallOptions, value: &Value) -> EngineResult<()> {
        self.warm_aggregate(ResourceMethod::Count, options, value).await
    }

    async fn warm_aggregate(&self, method: ResourceMethod, options: &CallOptions, value: &Value) -> EngineResult<()> {
        self.warm_aggregate_with_params(method, options, &Value::Null, value).await
    }

    async fn warm_aggregate_with_params(&self, method: ResourceMethod, options: &CallOptions, params: &Value, value: &Value) -> EngineResult<()> {
        let key = self.key_for(method, None, options, params);
        let bytes = serde_json::to_vec(value).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        self.driver.set(&key, bytes).await
    }

    pub async fn invalidate(&self, id: &str) -> EngineResult<()> {
        for method in [ResourceMethod::Get, ResourceMethod::Exists, ResourceMethod::Content, ResourceMethod::HasContent] {
            let key = self.key_for(method, Some(id), &CallOptions::default(), &Value::Null);
            self.driver.clear_prefix(&key).await?;
        }
        Ok(())
    }

    pub async fn clear_all(&self) -> EngineResult<()> {
        self.driver.clear_prefix(&key::resource_prefix(&self.resource_name)).await
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_driver(&self) -> &CacheDriverKind {
        &self.driver
    }
}

/// C7: the cache engine. Wraps a driver, a per-resource filter, stats, and the
/// retry policy used by invalidation, and installs read-through/write-invalidate
/// middleware on every resource that passes the configured filter.
pub struct CachePlugin {
    core: Arc<PluginCore>,
    driver: CacheDriverKind,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl CachePlugin {
    pub fn new(core: Arc<PluginCore>, driver: CacheDriverKind, config: CacheConfig) -> Self {
        Self { core, driver, config, stats: Arc::new(CacheStats::new()) }
    }

    /// Installs read-through and invalidation middleware on `resource` if it
    /// passes the configured filter. Idempotent per call site: re-registering
    /// the same plugin on the same resource appends another layer, matching the
    /// append-only middleware contract — callers are expected to install once.
    pub fn install_resource(&self, resource: &Arc<dyn Resource>) -> bool {
        if !self.config.filter.matches(resource.as_ref()) {
            return false;
        }

        let read_mw = Arc::new(CacheReadMiddleware { driver: self.driver.clone(), stats: self.stats.clone() });
        for method in resourcebase_core::resource::ResourceMethod::CACHEABLE_READS {
            resource.middleware().use_middleware(*method, read_mw.clone());
        }

        let invalidate_mw = Arc::new(CacheInvalidateMiddleware {
            driver: self.driver.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            partitions: resource.schema().partitions.clone(),
            core: self.core.clone(),
        });
        for method in resourcebase_core::resource::ResourceMethod::INVALIDATING_WRITES {
            resource.middleware().use_middleware(*method, invalidate_mw.clone());
        }
        true
    }

    pub fn namespace(&self, resource_name: impl Into<String>) -> CacheNamespace {
        CacheNamespace { resource_name: resource_name.into(), driver: self.driver.clone(), stats: self.stats.clone() }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCacheDriver, MemoryDriverConfig};
    use resourcebase_core::resource::{handler, CreatedBy, HookRegistry, MiddlewareChain, ResourceSchema};
    use resourcebase_core::InMemoryObjectStore;
    use resourcebase_plugin::cron::TokioCronScheduler;
    use resourcebase_plugin::event_bus::EventBus;
    use resourcebase_plugin::plugin::PluginIdentity;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeResource {
        name: String,
        schema: ResourceSchema,
        middleware: MiddlewareChain,
        hooks: HookRegistry,
        backing: Arc<parking_lot::RwLock<HashMap<String, Value>>>,
        underlying_calls: Arc<AtomicU32>,
    }

    impl FakeResource {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                schema: ResourceSchema { attributes: Value::Null, partitions: vec![], timestamps: true, created_by: CreatedBy::User },
                middleware: MiddlewareChain::new(),
                hooks: HookRegistry::new(),
                backing: Arc::new(parking_lot::RwLock::new(HashMap::new())),
                underlying_calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
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
            let backing = self.backing.clone();
            let calls = self.underlying_calls.clone();
            handler(move |ctx: MethodCall| {
                let backing = backing.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    match method {
                        ResourceMethod::List => Ok(Value::Array(backing.read().values().cloned().collect())),
                        ResourceMethod::Update => {
                            let id = ctx.id.clone().unwrap_or_default();
                            backing.write().insert(id, ctx.args.clone());
                            Ok(ctx.args)
                        }
                        _ => Ok(Value::Null),
                    }
                }
            })
        }
    }

    async fn core_fixture() -> Arc<PluginCore> {
        let store = InMemoryObjectStore::shared();
        let events = Arc::new(EventBus::new());
        let cron = Arc::new(TokioCronScheduler::new().await.unwrap());
        Arc::new(PluginCore::new(PluginIdentity::new("cache"), store, events, cron))
    }

    #[tokio::test]
    async fn list_is_a_miss_then_a_hit() {
        let core = core_fixture().await;
        let driver = CacheDriverKind::Memory(Arc::new(MemoryCacheDriver::new(MemoryDriverConfig::default())));
        let plugin = CachePlugin::new(core, driver, CacheConfig::default());
        let resource: Arc<dyn Resource> = Arc::new(FakeResource::new("users"));
        assert!(plugin.install_resource(&resource));

        let call = MethodCall { resource_name: "users".into(), method: ResourceMethod::List, id: None, args: Value::Null, options: CallOptions::default() };
        resource.call(ResourceMethod::List, call.clone()).await.unwrap();
        resource.call(ResourceMethod::List, call).await.unwrap();

        let snapshot = plugin.stats();
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.hits, 1);
    }

    #[tokio::test]
    async fn update_invalidates_so_next_list_is_a_miss() {
        let core = core_fixture().await;
        let driver = CacheDriverKind::Memory(Arc::new(MemoryCacheDriver::new(MemoryDriverConfig::default())));
        let plugin = CachePlugin::new(core, driver, CacheConfig::default());
        let resource: Arc<dyn Resource> = Arc::new(FakeResource::new("users"));
        plugin.install_resource(&resource);

        let list_call = MethodCall { resource_name: "users".into(), method: ResourceMethod::List, id: None, args: Value::Null, options: CallOptions::default() };
        resource.call(ResourceMethod::List, list_call.clone()).await.unwrap();
        assert_eq!(plugin.stats().misses, 1);

        let update_call = MethodCall {
            resource_name: "users".into(),
            method: ResourceMethod::Update,
            id: Some("u9".into()),
            args: serde_json::json!({"name": "Ada"}),
            options: CallOptions::default(),
        };
        resource.call(ResourceMethod::Update, update_call).await.unwrap();

        resource.call(ResourceMethod::List, list_call).await.unwrap();
        assert_eq!(plugin.stats().misses, 2);
    }

    #[tokio::test]
    async fn skip_cache_option_bypasses_the_driver_entirely() {
        let core = core_fixture().await;
        let driver = CacheDriverKind::Memory(Arc::new(MemoryCacheDriver::new(MemoryDriverConfig::default())));
        let plugin = CachePlugin::new(core, driver, CacheConfig::default());
        let resource: Arc<dyn Resource> = Arc::new(FakeResource::new("users"));
        plugin.install_resource(&resource);

        let options = CallOptions { skip_cache: true, ..Default::default() };
        let call = MethodCall { resource_name: "users".into(), method: ResourceMethod::List, id: None, args: Value::Null, options };
        resource.call(ResourceMethod::List, call.clone()).await.unwrap();
        resource.call(ResourceMethod::List, call).await.unwrap();

        let snapshot = plugin.stats();
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.misses, 0);
    }

    #[test]
    fn filter_excludes_plugin_created_resources_by_default() {
        let filter = ResourceFilter::default();
        let mut plugin_resource = FakeResource::new("plg_ttl_index");
        plugin_resource.schema.created_by = CreatedBy::Plugin;
        assert!(!filter.matches(&plugin_resource));
        assert!(filter.matches(&FakeResource::new("users")));
    }
}
