use std::sync::Arc;

use futures::future::BoxFuture;
use resourcebase_core::{EngineResult, ResourceEvent};

/// `(context, entityId) -> bool`, gates whether a trigger fires on a given tick.
pub type ConditionFn = Arc<dyn Fn(serde_json::Value, String) -> BoxFuture<'static, EngineResult<bool>> + Send + Sync>;

/// Computes the runtime name of an event source per entity, e.g. `order-shipped-<id>`.
pub type DynamicEventName = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Where an `event` trigger subscribes.
#[derive(Clone)]
pub enum EventSource {
    /// An already-qualified name, typically built with
    /// `EventBus::plugin_event`/`EventBus::db_event`.
    Named(String),
    /// One of a resource's own lifecycle events.
    Resource { resource_name: String, event: ResourceEvent },
    /// A per-entity computed name, filtered so only the matching entity's
    /// trigger fires.
    Dynamic(DynamicEventName),
}

/// The source-specific part of a trigger.
#[derive(Clone)]
pub enum TriggerSource {
    /// Scans entities currently in the owning state on every cron tick.
    Cron { expr: String, timezone: Option<String> },
    /// Periodic polling; fires when `now >= record[field]`.
    Date { field: String, poll_cron: String, timezone: Option<String> },
    /// Periodic polling gated purely by `effect.condition`.
    Function { poll_cron: String, timezone: Option<String> },
    /// Event-driven; see [`EventSource`].
    Event { source: EventSource },
}

/// What happens when a trigger fires, shared across all four source kinds.
#[derive(Clone, Default)]
pub struct TriggerEffect {
    pub condition: Option<ConditionFn>,
    pub max_triggers: Option<u64>,
    pub on_max_triggers_reached: Option<String>,
    pub action: Option<String>,
    pub event: Option<String>,
    pub send_event: Option<String>,
    pub target_state: Option<String>,
}

impl TriggerEffect {
    pub fn with_condition(mut self, condition: ConditionFn) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_max_triggers(mut self, max: u64, on_reached: impl Into<String>) -> Self {
        self.max_triggers = Some(max);
        self.on_max_triggers_reached = Some(on_reached.into());
        self
    }

    pub fn with_action(mut self, action_name: impl Into<String>) -> Self {
        self.action = Some(action_name.into());
        self
    }

    pub fn with_event(mut self, event_name: impl Into<String>) -> Self {
        self.event = Some(event_name.into());
        self
    }

    pub fn with_send_event(mut self, event_name: impl Into<String>) -> Self {
        self.send_event = Some(event_name.into());
        self
    }

    pub fn with_target_state(mut self, state_name: impl Into<String>) -> Self {
        self.target_state = Some(state_name.into());
        self
    }
}

#[derive(Clone)]
pub struct TriggerConfig {
    pub name: String,
    pub source: TriggerSource,
    pub effect: TriggerEffect,
}

impl TriggerConfig {
    pub fn new(name: impl Into<String>, source: TriggerSource) -> Self {
        Self { name: name.into(), source, effect: TriggerEffect::default() }
    }

    pub fn with_effect(mut self, effect: TriggerEffect) -> Self {
        self.effect = effect;
        self
    }
}
