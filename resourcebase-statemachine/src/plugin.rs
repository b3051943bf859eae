use std::sync::Arc;

use async_trait::async_trait;
use resourcebase_core::EngineResult;
use resourcebase_plugin::{Plugin, PluginIdentity};

use crate::engine::StateMachineEngine;

/// C9 lifecycle wrapper. Machines are registered directly on the engine (via
/// [`StateMachineEngine::register_machine`]) ahead of `on_install` — registration
/// already wires a machine's cron/date/function/event triggers, so there is
/// nothing left for `on_start` to do. `on_uninstall` releases every cron job and
/// event subscription triggers installed explicitly, rather than relying on
/// drop order.
pub struct StateMachinePlugin {
    engine: Arc<StateMachineEngine>,
}

impl StateMachinePlugin {
    pub fn new(engine: Arc<StateMachineEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<StateMachineEngine> {
        &self.engine
    }
}

#[async_trait]
impl Plugin for StateMachinePlugin {
    fn identity(&self) -> &PluginIdentity {
        self.engine.identity()
    }

    async fn on_install(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn on_uninstall(&self, _purge_data: bool) -> EngineResult<()> {
        self.engine.teardown().await
    }
}
