use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use resourcebase_core::EngineResult;
use serde_json::Value;

use crate::retry::ActionRetryConfig;
use crate::trigger::TriggerConfig;

/// `{machineId, entityId}`, threaded through guards and actions.
#[derive(Debug, Clone)]
pub struct TransitionMeta {
    pub machine_id: String,
    pub entity_id: String,
}

pub type GuardFn = Arc<dyn Fn(Value, String, TransitionMeta) -> BoxFuture<'static, EngineResult<bool>> + Send + Sync>;
pub type ActionFn = Arc<dyn Fn(Value, TransitionMeta) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// One state in a machine: `on` maps an event to its target state name, `guards`
/// optionally names a guard (from the machine's guard table) that must pass
/// before the transition proceeds.
#[derive(Clone, Default)]
pub struct State {
    pub name: String,
    pub on: HashMap<String, String>,
    pub guards: HashMap<String, String>,
    pub entry: Option<String>,
    pub exit: Option<String>,
    pub is_final: bool,
    pub triggers: Vec<TriggerConfig>,
    pub retry: Option<ActionRetryConfig>,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.on.insert(event.into(), target.into());
        self
    }

    pub fn guard(mut self, event: impl Into<String>, guard_name: impl Into<String>) -> Self {
        self.guards.insert(event.into(), guard_name.into());
        self
    }

    pub fn entry(mut self, action_name: impl Into<String>) -> Self {
        self.entry = Some(action_name.into());
        self
    }

    pub fn exit(mut self, action_name: impl Into<String>) -> Self {
        self.exit = Some(action_name.into());
        self
    }

    pub fn finalstate(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }
}

/// `{initialState, states}` plus the named guard/action tables referenced by
/// state definitions, and optional resource-binding for `{resource, stateField}`.
pub struct Machine {
    pub id: String,
    pub initial_state: String,
    pub states: HashMap<String, State>,
    pub guards: HashMap<String, GuardFn>,
    pub actions: HashMap<String, ActionFn>,
    pub retry: Option<ActionRetryConfig>,
    pub resource: Option<String>,
    pub state_field: Option<String>,
}

impl Machine {
    pub fn new(id: impl Into<String>, initial_state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initial_state: initial_state.into(),
            states: HashMap::new(),
            guards: HashMap::new(),
            actions: HashMap::new(),
            retry: None,
            resource: None,
            state_field: None,
        }
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.states.insert(state.name.clone(), state);
        self
    }

    pub fn with_guard(mut self, name: impl Into<String>, guard: GuardFn) -> Self {
        self.guards.insert(name.into(), guard);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, action: ActionFn) -> Self {
        self.actions.insert(name.into(), action);
        self
    }

    pub fn with_retry(mut self, retry: ActionRetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn bound_to(mut self, resource: impl Into<String>, state_field: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self.state_field = Some(state_field.into());
        self
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    pub fn valid_events(&self, state_name: &str) -> Vec<String> {
        self.states.get(state_name).map(|s| s.on.keys().cloned().collect()).unwrap_or_default()
    }
}

/// The persisted `{currentState, context, lastTransition, updatedAt, triggerCounts}`
/// record for one entity under one machine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub current_state: String,
    pub context: Value,
    pub last_transition: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub trigger_counts: HashMap<String, u64>,
}

/// A persisted transition-log entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub machine_id: String,
    pub entity_id: String,
    pub event: String,
    pub from_state: String,
    pub to_state: String,
    pub context: Value,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}
