//! Plugin lifecycle, distributed locking, event bus and cron scheduling core.

pub mod cron;
pub mod event_bus;
pub mod plugin;
pub mod storage;

pub use cron::{CronHandler, CronJobId, CronScheduler, TokioCronScheduler};
pub use event_bus::{EventBus, EventHandler, SubscriptionToken};
pub use plugin::{derive_slug, Plugin, PluginCore, PluginIdentity};
pub use storage::{DistributedLock, LockHandle, LockOptions, PluginStorage};
