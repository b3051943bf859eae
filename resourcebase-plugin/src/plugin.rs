use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use resourcebase_core::{EngineResult, ObjectStoreClient};
use serde_json::Value;

use crate::cron::{CronHandler, CronJobId, CronScheduler};
use crate::event_bus::{EventBus, EventHandler, SubscriptionToken};
use crate::storage::PluginStorage;

/// Converts a CamelCase type name into kebab-case, stripping a trailing "Plugin" token.
///
/// `CachePlugin` -> `cache`, `TtlExpirationPlugin` -> `ttl-expiration`.
pub fn derive_slug(type_name: &str) -> String {
    let trimmed = type_name.strip_suffix("Plugin").unwrap_or(type_name);
    camel_to_kebab(trimmed)
}

fn camel_to_kebab(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    for (i, ch) in input.char_indices() {
        if ch.is_uppercase() && i != 0 {
            out.push('-');
        }
        out.extend(ch.to_lowercase());
    }
    out
}

/// Identifies one plugin instance attached to a database.
#[derive(Debug, Clone)]
pub struct PluginIdentity {
    pub slug: String,
    pub namespace: Option<String>,
    pub instance_key: String,
}

impl PluginIdentity {
    pub fn new(slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self { instance_key: slug.clone(), namespace: None, slug }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_instance_key(mut self, instance_key: impl Into<String>) -> Self {
        self.instance_key = instance_key.into();
        self
    }

    /// Resolves an internal resource's name: `plg_<namespace>_<base>` when a
    /// namespace is set, otherwise the plugin-supplied default (already prefixed).
    /// `default_name` is always passed in already carrying its `plg_` prefix
    /// (e.g. `plg_ttl_expiration_index`); that prefix is stripped before the
    /// namespace is spliced in so namespacing never double-prefixes.
    pub fn resource_name(&self, default_name: &str) -> String {
        match &self.namespace {
            Some(ns) => {
                let base = default_name.strip_prefix("plg_").unwrap_or(default_name);
                format!("plg_{ns}_{base}")
            }
            None => default_name.to_string(),
        }
    }
}

/// C5: plugin lifecycle. `install` binds a plugin instance to a database and
/// should create any internal resources idempotently; `start`/`stop` toggle
/// background activity (cron jobs, subscriptions); `uninstall` tears everything
/// down and optionally purges plugin-owned data.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn identity(&self) -> &PluginIdentity;
    async fn on_install(&self) -> EngineResult<()>;
    async fn on_start(&self) -> EngineResult<()> {
        Ok(())
    }
    async fn on_stop(&self) -> EngineResult<()> {
        Ok(())
    }
    async fn on_uninstall(&self, _purge_data: bool) -> EngineResult<()> {
        Ok(())
    }
}

/// Shared bookkeeping every concrete plugin composes: lazily-initialized storage,
/// an event-bus handle, cron scheduling with automatic teardown on stop, and
/// explicit subscription teardown on uninstall (per the REDESIGN FLAGS directive
/// against implicit cycles).
pub struct PluginCore {
    pub identity: PluginIdentity,
    pub storage: PluginStorage,
    pub events: Arc<EventBus>,
    cron: Arc<dyn CronScheduler>,
    cron_jobs: Mutex<Vec<CronJobId>>,
    subscribed_events: Mutex<Vec<(String, SubscriptionToken)>>,
}

impl PluginCore {
    pub fn new(
        identity: PluginIdentity,
        object_store: Arc<dyn ObjectStoreClient>,
        events: Arc<EventBus>,
        cron: Arc<dyn CronScheduler>,
    ) -> Self {
        let storage = PluginStorage::new(object_store, identity.slug.clone());
        Self { identity, storage, events, cron, cron_jobs: Mutex::new(Vec::new()), subscribed_events: Mutex::new(Vec::new()) }
    }

    pub async fn schedule_cron(&self, expr: &str, handler: CronHandler) -> EngineResult<CronJobId> {
        self.schedule_cron_tz(expr, handler, None).await
    }

    /// Same as [`PluginCore::schedule_cron`] but against an explicit IANA
    /// timezone (e.g. `"America/New_York"`) instead of UTC.
    pub async fn schedule_cron_tz(&self, expr: &str, handler: CronHandler, timezone: Option<&str>) -> EngineResult<CronJobId> {
        let id = self.cron.schedule(expr, handler, timezone).await?;
        self.cron_jobs.lock().push(id);
        Ok(id)
    }

    pub fn subscribe(&self, event_name: impl Into<String>, handler: EventHandler) {
        let event_name = event_name.into();
        let token = self.events.subscribe(event_name.clone(), handler);
        self.subscribed_events.lock().push((event_name, token));
    }

    pub async fn emit(&self, event: &str, payload: Value) {
        self.events.emit(&EventBus::plugin_event(&self.identity.slug, event), payload).await;
    }

    /// Disposes every cron job this plugin registered and unsubscribes every
    /// event handler it installed. Removal is scoped to this plugin's own
    /// subscription tokens, so another plugin listening on the same event name
    /// (a shared `db:*` event, for instance) is left untouched. Called from
    /// `on_stop`/`on_uninstall`.
    pub async fn teardown(&self) -> EngineResult<()> {
        let jobs: Vec<CronJobId> = self.cron_jobs.lock().drain(..).collect();
        for id in jobs {
            self.cron.stop(id).await?;
        }
        let events: Vec<(String, SubscriptionToken)> = self.subscribed_events.lock().drain(..).collect();
        for (name, token) in events {
            self.events.unsubscribe(&name, token);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_slug_from_camel_case_plugin_name() {
        assert_eq!(derive_slug("CachePlugin"), "cache");
        assert_eq!(derive_slug("TtlExpirationPlugin"), "ttl-expiration");
        assert_eq!(derive_slug("StateMachinePlugin"), "state-machine");
    }

    #[test]
    fn resource_name_uses_namespace_when_set() {
        let identity = PluginIdentity::new("cache");
        assert_eq!(identity.resource_name("plg_cache_stats"), "plg_cache_stats");
        let namespaced = identity.with_namespace("tenant-a");
        assert_eq!(namespaced.resource_name("plg_cache_stats"), "plg_tenant-a_cache_stats");
    }
}
