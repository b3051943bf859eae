//! Entry point: wires an object store into the plugin runtime and brings up the
//! cache, TTL and state-machine engines as a single long-running process.

use std::sync::Arc;

use anyhow::{Context, Result};
use resourcebase_cache::{CacheConfig, CacheDriverKind, CachePlugin, MemoryCacheDriver, MemoryDriverConfig};
use resourcebase_core::{InMemoryObjectStore, ObjectStoreClient, RootConfig};
use resourcebase_plugin::{EventBus, PluginCore, PluginIdentity, TokioCronScheduler};
use resourcebase_statemachine::{StateMachineEngine, StateMachinePlugin};
use resourcebase_ttl::TtlPlugin;
use tokio::signal;
use tracing::{error, info};

/// Orchestrates the three higher-order engines over one shared object store and
/// event bus, with an explicit dependency-ordered `start`/`stop` rather than
/// relying on drop order.
struct ResourceBase {
    config: RootConfig,
    object_store: Arc<dyn ObjectStoreClient>,
    cache: Arc<CachePlugin>,
    ttl: Arc<TtlPlugin>,
    state_machine: Arc<StateMachinePlugin>,
}

impl ResourceBase {
    async fn new(config: RootConfig) -> Result<Self> {
        // A real deployment supplies its own `ObjectStoreClient` adapter over its
        // S3-compatible backend (C1 is explicitly an external collaborator); the
        // in-memory store stands in here so the binary runs standalone.
        let object_store: Arc<dyn ObjectStoreClient> = InMemoryObjectStore::shared();
        let events = Arc::new(EventBus::new());
        let cron = Arc::new(TokioCronScheduler::new().await.context("failed to start cron scheduler")?);

        let cache_core = Arc::new(PluginCore::new(PluginIdentity::new("cache"), object_store.clone(), events.clone(), cron.clone()));
        let cache_driver = CacheDriverKind::Memory(Arc::new(MemoryCacheDriver::with_event_bus(MemoryDriverConfig::default(), Some(events.clone()))));
        let cache = Arc::new(CachePlugin::new(cache_core, cache_driver, CacheConfig::default()));

        let ttl_core = Arc::new(PluginCore::new(PluginIdentity::new("ttl"), object_store.clone(), events.clone(), cron.clone()));
        let ttl = Arc::new(TtlPlugin::new(
            ttl_core,
            object_store.clone(),
            config.ttl.minute_cohort_lookback,
            config.ttl.hour_cohort_lookback,
            config.ttl.batch_size,
        ));

        let state_machine_core = Arc::new(PluginCore::new(PluginIdentity::new("state-machine"), object_store.clone(), events.clone(), cron));
        let engine = Arc::new(StateMachineEngine::new(
            state_machine_core,
            object_store.clone(),
            config.state_machine.lock_ttl_seconds,
            config.state_machine.lock_timeout_ms,
        ));
        let state_machine = Arc::new(StateMachinePlugin::new(engine));

        Ok(Self { config, object_store, cache, ttl, state_machine })
    }

    /// Starts background activity: the TTL cohort sweepers and the state machine's
    /// `on_install` hook. Cache middleware is installed per-resource by the host
    /// application via [`CachePlugin::install_resource`], not here.
    async fn start(&self) -> Result<()> {
        info!("starting resourcebase engines");
        self.ttl.start_sweepers().await.context("failed to start ttl sweepers")?;
        self.state_machine.on_install().await.context("state machine on_install failed")?;
        info!("resourcebase engines started");
        Ok(())
    }

    /// Stops every background task this process registered. The object store and
    /// any data it holds are left untouched.
    async fn stop(&self) -> Result<()> {
        info!("stopping resourcebase engines");
        if let Err(e) = self.state_machine.on_uninstall(false).await {
            error!(error = %e, "state machine teardown failed");
        }
        if let Err(e) = self.ttl.teardown().await {
            error!(error = %e, "ttl sweeper teardown failed");
        }
        info!("resourcebase engines stopped");
        Ok(())
    }
}

use resourcebase_plugin::Plugin;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("resourcebase=info".parse()?))
        .json()
        .init();

    info!("starting resourcebase");

    let config = RootConfig::load(std::env::var("RESOURCEBASE_CONFIG").ok().as_deref()).context("failed to load configuration")?;
    let app = ResourceBase::new(config).await.context("failed to initialize resourcebase")?;

    app.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
    }

    app.stop().await?;
    info!("resourcebase stopped");
    Ok(())
}
