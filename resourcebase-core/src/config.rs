use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Aggregate configuration loaded with precedence defaults < config file < environment,
/// env vars prefixed `RESOURCEBASE_` (e.g. `RESOURCEBASE_CACHE__DEFAULT_TTL_SECONDS=60`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub cache: CacheRuntimeConfig,
    #[serde(default)]
    pub ttl: TtlRuntimeConfig,
    #[serde(default)]
    pub state_machine: StateMachineRuntimeConfig,
    #[serde(default)]
    pub plugin_runtime: PluginRuntimeConfig,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            cache: CacheRuntimeConfig::default(),
            ttl: TtlRuntimeConfig::default(),
            state_machine: StateMachineRuntimeConfig::default(),
            plugin_runtime: PluginRuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRuntimeConfig {
    pub default_ttl_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CacheRuntimeConfig {
    fn default() -> Self {
        Self { default_ttl_seconds: 300, retry_attempts: 3, retry_delay_ms: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlRuntimeConfig {
    pub minute_cohort_lookback: u32,
    pub hour_cohort_lookback: u32,
    pub batch_size: usize,
}

impl Default for TtlRuntimeConfig {
    fn default() -> Self {
        Self { minute_cohort_lookback: 3, hour_cohort_lookback: 2, batch_size: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineRuntimeConfig {
    pub lock_ttl_seconds: u64,
    pub lock_timeout_ms: u64,
}

impl Default for StateMachineRuntimeConfig {
    fn default() -> Self {
        Self { lock_ttl_seconds: 30, lock_timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRuntimeConfig {
    pub storage_prefix: String,
}

impl Default for PluginRuntimeConfig {
    fn default() -> Self {
        Self { storage_prefix: "plg".to_string() }
    }
}

impl RootConfig {
    /// Loads defaults, then an optional config file (`config_path`, any format `config`
    /// supports), then environment variables prefixed `RESOURCEBASE_` with `__` as the
    /// nesting separator.
    pub fn load(config_path: Option<&str>) -> EngineResult<Self> {
        let defaults = RootConfig::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults).map_err(|e| {
            EngineError::configuration_invalid("root", format!("failed to seed config defaults: {e}"))
        })?);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("RESOURCEBASE").separator("__"));

        let built = builder
            .build()
            .map_err(|e| EngineError::configuration_invalid("root", format!("failed to build config: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| EngineError::configuration_invalid("root", format!("failed to deserialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let cfg = RootConfig::load(None).unwrap();
        assert_eq!(cfg.cache.default_ttl_seconds, 300);
        assert_eq!(cfg.ttl.minute_cohort_lookback, 3);
    }

    #[test]
    fn env_override_takes_precedence_over_defaults() {
        std::env::set_var("RESOURCEBASE_CACHE__DEFAULT_TTL_SECONDS", "60");
        let cfg = RootConfig::load(None).unwrap();
        assert_eq!(cfg.cache.default_ttl_seconds, 60);
        std::env::remove_var("RESOURCEBASE_CACHE__DEFAULT_TTL_SECONDS");
    }
}
