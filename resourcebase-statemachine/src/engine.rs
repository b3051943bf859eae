use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use resourcebase_core::error::LockError;
use resourcebase_core::{CallOptions, EngineError, EngineResult, InternalStore, MethodCall, ObjectStoreClient, Resource, ResourceEvent, ResourceMethod, RetryPolicy};
use resourcebase_plugin::{DistributedLock, LockOptions, PluginCore};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::machine::{EntityState, Machine, TransitionMeta, TransitionRecord};
use crate::retry::{run_with_retry, ActionRetryConfig};
use crate::trigger::{EventSource, TriggerConfig, TriggerSource};

fn entity_key(machine_id: &str, entity_id: &str) -> String {
    format!("{machine_id}_{entity_id}")
}

/// C9: the guarded state-machine runtime. Owns the per-machine registry, the
/// persistent entity state store and transition log, and the per-entity
/// distributed lock that serializes `send` against concurrent callers.
pub struct StateMachineEngine {
    core: Arc<PluginCore>,
    machines: DashMap<String, Arc<Machine>>,
    state_store: InternalStore,
    transition_log: InternalStore,
    lock: DistributedLock,
    lock_ttl_seconds: u64,
    lock_timeout_ms: u64,
    transition_log_retry: RetryPolicy,
    global_retry: ActionRetryConfig,
    resources: DashMap<String, Arc<dyn Resource>>,
}

impl StateMachineEngine {
    pub fn new(core: Arc<PluginCore>, object_store: Arc<dyn ObjectStoreClient>, lock_ttl_seconds: u64, lock_timeout_ms: u64) -> Self {
        let state_store = InternalStore::new(object_store.clone(), core.identity.resource_name("plg_state_entities"));
        let transition_log = InternalStore::new(object_store.clone(), core.identity.resource_name("plg_state_transitions"));
        let lock = DistributedLock::new(object_store, format!("{}-transitions", core.identity.slug));
        Self {
            core,
            machines: DashMap::new(),
            state_store,
            transition_log,
            lock,
            lock_ttl_seconds,
            lock_timeout_ms,
            transition_log_retry: RetryPolicy::default(),
            global_retry: ActionRetryConfig::default(),
            resources: DashMap::new(),
        }
    }

    pub fn with_global_retry(mut self, retry: ActionRetryConfig) -> Self {
        self.global_retry = retry;
        self
    }

    /// Registers a machine and starts its cron/date/function/event triggers.
    pub async fn register_machine(self: &Arc<Self>, machine: Machine) -> EngineResult<()> {
        let machine = Arc::new(machine);
        if let Some(resource_name) = &machine.resource {
            if !self.resources.contains_key(resource_name) {
                warn!(resource = %resource_name, "state machine bound to a resource that has not been registered via bind_resource");
            }
        }
        for state in machine.states.values() {
            for trigger in &state.triggers {
                self.wire_trigger(&machine, state.name.clone(), trigger.clone()).await?;
            }
        }
        self.machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    /// Makes a resource available for binding (`stateField` sync) and for
    /// resource-scoped event triggers.
    pub fn bind_resource(&self, resource: Arc<dyn Resource>) {
        self.resources.insert(resource.name().to_string(), resource);
    }

    async fn wire_trigger(self: &Arc<Self>, machine: &Arc<Machine>, state_name: String, trigger: TriggerConfig) -> EngineResult<()> {
        match trigger.source.clone() {
            TriggerSource::Cron { expr, timezone } => {
                let engine = self.clone();
                let machine = machine.clone();
                self.core
                    .schedule_cron_tz(
                        &expr,
                        Arc::new(move || {
                            let engine = engine.clone();
                            let machine = machine.clone();
                            let state_name = state_name.clone();
                            let trigger = trigger.clone();
                            Box::pin(async move { engine.sweep_state_triggers(&machine, &state_name, &trigger, None).await })
                        }),
                        timezone.as_deref(),
                    )
                    .await?;
            }
            TriggerSource::Date { field, poll_cron, timezone } => {
                let engine = self.clone();
                let machine = machine.clone();
                self.core
                    .schedule_cron_tz(
                        &poll_cron,
                        Arc::new(move || {
                            let engine = engine.clone();
                            let machine = machine.clone();
                            let state_name = state_name.clone();
                            let trigger = trigger.clone();
                            let field = field.clone();
                            Box::pin(async move { engine.sweep_state_triggers(&machine, &state_name, &trigger, Some(field)).await })
                        }),
                        timezone.as_deref(),
                    )
                    .await?;
            }
            TriggerSource::Function { poll_cron, timezone } => {
                let engine = self.clone();
                let machine = machine.clone();
                self.core
                    .schedule_cron_tz(
                        &poll_cron,
                        Arc::new(move || {
                            let engine = engine.clone();
                            let machine = machine.clone();
                            let state_name = state_name.clone();
                            let trigger = trigger.clone();
                            Box::pin(async move { engine.sweep_state_triggers(&machine, &state_name, &trigger, None).await })
                        }),
                        timezone.as_deref(),
                    )
                    .await?;
            }
            TriggerSource::Event { source } => match source {
                EventSource::Named(name) => {
                    let engine = self.clone();
                    let machine = machine.clone();
                    self.core.subscribe(
                        name,
                        Arc::new(move |payload| {
                            let engine = engine.clone();
                            let machine = machine.clone();
                            let state_name = state_name.clone();
                            let trigger = trigger.clone();
                            Box::pin(async move {
                                if let Some(entity_id) = payload.get("entityId").and_then(Value::as_str) {
                                    engine.fire_trigger_for_entity(&machine, &state_name, &trigger, entity_id).await;
                                }
                            })
                        }),
                    );
                }
                EventSource::Resource { resource_name, event } => {
                    if let Some(resource) = self.resources.get(&resource_name) {
                        let engine = self.clone();
                        let machine = machine.clone();
                        resource.hooks().add_hook(
                            event,
                            Arc::new(move |ctx, result| {
                                let engine = engine.clone();
                                let machine = machine.clone();
                                let state_name = state_name.clone();
                                let trigger = trigger.clone();
                                let id = ctx.id.clone().or_else(|| result.get("id").and_then(Value::as_str).map(str::to_string));
                                Box::pin(async move {
                                    if let Some(entity_id) = id {
                                        engine.fire_trigger_for_entity(&machine, &state_name, &trigger, &entity_id).await;
                                    }
                                    Ok(())
                                })
                            }),
                        );
                    } else {
                        return Err(EngineError::RelatedResourceMissing { resource_name });
                    }
                }
                EventSource::Dynamic(_) => {
                    // Per-entity dynamic event names can't be pre-enumerated at registration
                    // time; callers opt a specific entity in via `subscribe_dynamic_trigger`.
                }
            },
        }
        Ok(())
    }

    /// Subscribes one entity's dynamically-named event source. Needed because a
    /// [`EventSource::Dynamic`] trigger's event name depends on the entity id,
    /// so it cannot be wired up-front the way the other three sources are.
    pub fn subscribe_dynamic_trigger(self: &Arc<Self>, machine_id: &str, state_name: &str, trigger: &TriggerConfig, entity_id: &str) -> EngineResult<()> {
        let machine = self.machines.get(machine_id).map(|m| m.clone()).ok_or_else(|| EngineError::RelatedResourceMissing { resource_name: machine_id.to_string() })?;
        let EventSource::Dynamic(name_fn) = (match &trigger.source {
            TriggerSource::Event { source } => source,
            _ => return Err(EngineError::configuration_invalid("state-machine", "subscribe_dynamic_trigger called on a non-event trigger")),
        }) else {
            return Err(EngineError::configuration_invalid("state-machine", "subscribe_dynamic_trigger called on a non-dynamic event source"));
        };
        let event_name = name_fn(entity_id);
        let engine = self.clone();
        let state_name = state_name.to_string();
        let trigger = trigger.clone();
        let entity_id = entity_id.to_string();
        self.core.subscribe(
            event_name,
            Arc::new(move |_payload| {
                let engine = engine.clone();
                let machine = machine.clone();
                let state_name = state_name.clone();
                let trigger = trigger.clone();
                let entity_id = entity_id.clone();
                Box::pin(async move { engine.fire_trigger_for_entity(&machine, &state_name, &trigger, &entity_id).await })
            }),
        );
        Ok(())
    }

    async fn sweep_state_triggers(&self, machine: &Arc<Machine>, state_name: &str, trigger: &TriggerConfig, date_field: Option<String>) {
        let entries = match self.state_store.list_in_index("byState", state_name).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, state = state_name, "failed to scan state for trigger sweep");
                return;
            }
        };
        let now = Utc::now();
        for (key, raw) in entries {
            let entity_id = match key.strip_prefix(&format!("{}:", machine.id)) {
                Some(id) => id.to_string(),
                None => continue,
            };
            if let Some(field) = &date_field {
                let Ok(state): Result<EntityState, _> = serde_json::from_value(raw) else { continue };
                let due = state.context.get(field).and_then(Value::as_str).and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt < now).unwrap_or(false);
                if !due {
                    continue;
                }
            }
            self.fire_trigger_for_entity(machine, state_name, trigger, &entity_id).await;
        }
    }

    async fn fire_trigger_for_entity(&self, machine: &Arc<Machine>, state_name: &str, trigger: &TriggerConfig, entity_id: &str) {
        if let Err(e) = self.try_fire_trigger(machine, state_name, trigger, entity_id).await {
            warn!(machine = %machine.id, entity = entity_id, trigger = %trigger.name, error = %e, "trigger execution failed");
        }
    }

    async fn try_fire_trigger(&self, machine: &Arc<Machine>, state_name: &str, trigger: &TriggerConfig, entity_id: &str) -> EngineResult<()> {
        let key = entity_key(&machine.id, entity_id);
        let Some(raw) = self.state_store.get(&key).await? else { return Ok(()) };
        let mut entity_state: EntityState = serde_json::from_value(raw).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        if entity_state.current_state != state_name {
            return Ok(()); // stale: the entity has since moved on
        }

        let meta = TransitionMeta { machine_id: machine.id.clone(), entity_id: entity_id.to_string() };
        if let Some(condition) = &trigger.effect.condition {
            if !condition(entity_state.context.clone(), entity_id.to_string()).await? {
                return Ok(());
            }
        }

        if let Some(max) = trigger.effect.max_triggers {
            let count = entity_state.trigger_counts.get(&trigger.name).copied().unwrap_or(0);
            if count >= max {
                if let Some(event_name) = &trigger.effect.on_max_triggers_reached {
                    self.core.emit(event_name, serde_json::json!({"machineId": machine.id, "entityId": entity_id, "trigger": trigger.name})).await;
                }
                return Ok(());
            }
        }

        if let Some(action_name) = &trigger.effect.action {
            let action = machine.actions.get(action_name).ok_or_else(|| EngineError::configuration_invalid("state-machine", format!("unknown action '{action_name}'")))?.clone();
            let retry = self.global_retry.merge(machine.retry.as_ref(), machine.states.get(state_name).and_then(|s| s.retry.as_ref()));
            let ctx = entity_state.context.clone();
            run_with_retry(&retry, || {
                let action = action.clone();
                let ctx = ctx.clone();
                let meta = meta.clone();
                async move { action(ctx, meta).await }
            })
            .await?;
        }

        if let Some(event_name) = &trigger.effect.event {
            self.core.emit(event_name, serde_json::json!({"machineId": machine.id, "entityId": entity_id, "trigger": trigger.name})).await;
        }

        if let Some(send_event) = &trigger.effect.send_event {
            self.send(&machine.id, entity_id, send_event, entity_state.context.clone()).await?;
            return Ok(()); // send() already persists the updated state and counts below would race it
        }

        if let Some(target_state) = &trigger.effect.target_state {
            self.transition_to(machine, entity_id, target_state, entity_state.context.clone()).await?;
        }

        *entity_state.trigger_counts.entry(trigger.name.clone()).or_insert(0) += 1;
        entity_state.updated_at = Utc::now();
        self.state_store.put(&key, &serde_json::to_value(&entity_state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?).await
    }

    /// An automatic transition driven by a trigger's `targetState`, bypassing the
    /// event/guard lookup `send` performs (the trigger has already decided the
    /// target). Still holds the per-entity lock and still runs the target's
    /// entry action and keeps a bound resource's `stateField` in sync.
    async fn transition_to(&self, machine: &Arc<Machine>, entity_id: &str, target_state: &str, context: Value) -> EngineResult<()> {
        let lock_name = format!("transition-{}-{entity_id}", machine.id);
        let handle = self
            .lock
            .acquire(&lock_name, LockOptions { ttl_seconds: self.lock_ttl_seconds, timeout_ms: self.lock_timeout_ms, owner_id: None })
            .await?
            .ok_or_else(|| EngineError::from(LockError::Contention { name: lock_name.clone(), timeout_ms: self.lock_timeout_ms }))?;

        let result = self.apply_transition(machine, entity_id, "trigger", target_state, context).await;

        if let Err(e) = self.lock.release(&handle).await {
            warn!(lock = %lock_name, error = %e, "failed to release state machine lock");
        }
        result.map(|_| ())
    }

    /// `send(machineId, entityId, event, context)`: the nine-step guarded
    /// transition protocol.
    pub async fn send(&self, machine_id: &str, entity_id: &str, event: &str, context: Value) -> EngineResult<Value> {
        let machine = self.machines.get(machine_id).map(|m| m.clone()).ok_or_else(|| EngineError::RelatedResourceMissing { resource_name: machine_id.to_string() })?;

        // Step 1: acquire the per-entity lock.
        let lock_name = format!("transition-{machine_id}-{entity_id}");
        let handle = self
            .lock
            .acquire(&lock_name, LockOptions { ttl_seconds: self.lock_ttl_seconds, timeout_ms: self.lock_timeout_ms, owner_id: None })
            .await?
            .ok_or_else(|| EngineError::from(LockError::Contention { name: lock_name.clone(), timeout_ms: self.lock_timeout_ms }))?;

        let result = self.send_locked(&machine, entity_id, event, context).await;

        // Step 9: release the lock regardless of outcome; failure here is logged, not propagated.
        if let Err(e) = self.lock.release(&handle).await {
            warn!(lock = %lock_name, error = %e, "failed to release state machine lock");
        }
        result
    }

    async fn send_locked(&self, machine: &Arc<Machine>, entity_id: &str, event: &str, context: Value) -> EngineResult<Value> {
        let key = entity_key(&machine.id, entity_id);

        // Step 2: resolve current state.
        let existing = self.state_store.get(&key).await?;
        let (current_state_name, merged_context, trigger_counts) = match &existing {
            Some(raw) => {
                let state: EntityState = serde_json::from_value(raw.clone()).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
                (state.current_state, state.context, state.trigger_counts)
            }
            None => (machine.initial_state.clone(), Value::Null, Default::default()),
        };
        let context = if context.is_null() { merged_context } else { context };

        let current_state = machine.state(&current_state_name).ok_or_else(|| EngineError::InvariantViolation { message: format!("machine '{}' has no state '{current_state_name}'", machine.id) })?;

        // Step 3: the event must be valid from the current state.
        let target_state_name = current_state.on.get(event).cloned().ok_or_else(|| {
            EngineError::InvariantViolation { message: format!("event '{event}' is not valid from state '{current_state_name}'; valid events: {:?}", machine.valid_events(&current_state_name)) }
        })?;

        // Step 4: evaluate the guard, if any.
        if let Some(guard_name) = current_state.guards.get(event) {
            let guard = machine.guards.get(guard_name).ok_or_else(|| EngineError::configuration_invalid("state-machine", format!("unknown guard '{guard_name}'")))?;
            let meta = TransitionMeta { machine_id: machine.id.clone(), entity_id: entity_id.to_string() };
            let passed = guard(context.clone(), event.to_string(), meta).await.map_err(|e| EngineError::GuardBlocked { message: e.to_string() })?;
            if !passed {
                return Err(EngineError::GuardBlocked { message: format!("guard '{guard_name}' blocked event '{event}' from state '{current_state_name}'") });
            }
        }

        let exit_retry = self.global_retry.merge(machine.retry.as_ref(), current_state.retry.as_ref());

        // Step 5: exit action of the current state.
        if let Some(exit_name) = &current_state.exit {
            self.run_named_action(machine, exit_name, &context, entity_id, &exit_retry).await?;
        }

        let mut new_state = EntityState { current_state: target_state_name.clone(), context: context.clone(), last_transition: Some(event.to_string()), updated_at: Utc::now(), trigger_counts };

        // Step 6: persist the transition log (retried), then upsert the state store.
        let transition_id = Uuid::new_v4().to_string();
        let record = TransitionRecord {
            machine_id: machine.id.clone(),
            entity_id: entity_id.to_string(),
            event: event.to_string(),
            from_state: current_state_name.clone(),
            to_state: target_state_name.clone(),
            context: context.clone(),
            occurred_at: Utc::now(),
        };
        let record_value = serde_json::to_value(&record).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        let date = record.occurred_at.format("%Y-%m-%d").to_string();
        resourcebase_core::retry_with_backoff(&self.transition_log_retry, || {
            let record_value = record_value.clone();
            let machine_id = machine.id.clone();
            let date = date.clone();
            let transition_id = transition_id.clone();
            async move { self.transition_log.put_indexed_multi(&transition_id, &record_value, &[("byMachine", &machine_id), ("byDate", &date)]).await }
        })
        .await?;

        if existing.is_some() {
            self.state_store.remove_index("byState", &current_state_name, &key).await?;
        }
        self.state_store.put_indexed(&key, &serde_json::to_value(&new_state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?, "byState", &target_state_name).await?;

        // Step 7: entry action of the target state.
        let target_state = machine.state(&target_state_name).ok_or_else(|| EngineError::InvariantViolation { message: format!("machine '{}' has no state '{target_state_name}'", machine.id) })?;
        if let Some(entry_name) = &target_state.entry {
            let entry_retry = self.global_retry.merge(machine.retry.as_ref(), target_state.retry.as_ref());
            self.run_named_action(machine, entry_name, &context, entity_id, &entry_retry).await?;
        }

        if let Some(resource_name) = &machine.resource {
            if let Some(field) = &machine.state_field {
                self.sync_bound_resource(resource_name, field, entity_id, &target_state_name).await?;
            }
        }

        // Step 8: emit the transition event.
        self.core
            .emit(
                "transition",
                serde_json::json!({
                    "machineId": machine.id,
                    "entityId": entity_id,
                    "event": event,
                    "fromState": current_state_name,
                    "toState": target_state_name,
                }),
            )
            .await;

        new_state.context = context;
        serde_json::to_value(&new_state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })
    }

    async fn apply_transition(&self, machine: &Arc<Machine>, entity_id: &str, event_label: &str, target_state_name: &str, context: Value) -> EngineResult<Value> {
        let key = entity_key(&machine.id, entity_id);
        let existing = self.state_store.get(&key).await?;
        let current_state_name = match &existing {
            Some(raw) => serde_json::from_value::<EntityState>(raw.clone()).map(|s| s.current_state).unwrap_or_else(|_| machine.initial_state.clone()),
            None => machine.initial_state.clone(),
        };
        let trigger_counts = match &existing {
            Some(raw) => serde_json::from_value::<EntityState>(raw.clone()).map(|s| s.trigger_counts).unwrap_or_default(),
            None => Default::default(),
        };

        let target_state = machine.state(target_state_name).ok_or_else(|| EngineError::InvariantViolation { message: format!("machine '{}' has no state '{target_state_name}'", machine.id) })?;
        let retry = self.global_retry.merge(machine.retry.as_ref(), target_state.retry.as_ref());
        if let Some(entry_name) = &target_state.entry {
            self.run_named_action(machine, entry_name, &context, entity_id, &retry).await?;
        }

        let new_state = EntityState { current_state: target_state_name.to_string(), context: context.clone(), last_transition: Some(event_label.to_string()), updated_at: Utc::now(), trigger_counts };
        if existing.is_some() && current_state_name != target_state_name {
            self.state_store.remove_index("byState", &current_state_name, &key).await?;
        }
        self.state_store.put_indexed(&key, &serde_json::to_value(&new_state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?, "byState", target_state_name).await?;

        if let Some(resource_name) = &machine.resource {
            if let Some(field) = &machine.state_field {
                self.sync_bound_resource(resource_name, field, entity_id, target_state_name).await?;
            }
        }

        self.core
            .emit("transition", serde_json::json!({"machineId": machine.id, "entityId": entity_id, "event": event_label, "toState": target_state_name}))
            .await;

        serde_json::to_value(&new_state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })
    }

    async fn run_named_action(&self, machine: &Arc<Machine>, action_name: &str, context: &Value, entity_id: &str, retry: &ActionRetryConfig) -> EngineResult<()> {
        let action = machine.actions.get(action_name).ok_or_else(|| EngineError::configuration_invalid("state-machine", format!("unknown action '{action_name}'")))?.clone();
        let meta = TransitionMeta { machine_id: machine.id.clone(), entity_id: entity_id.to_string() };
        run_with_retry(retry, || {
            let action = action.clone();
            let context = context.clone();
            let meta = meta.clone();
            async move { action(context, meta).await }
        })
        .await
    }

    async fn sync_bound_resource(&self, resource_name: &str, field: &str, entity_id: &str, new_state: &str) -> EngineResult<()> {
        let Some(resource) = self.resources.get(resource_name).map(|r| r.clone()) else { return Ok(()) };
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), Value::String(new_state.to_string()));
        resource
            .call(
                ResourceMethod::Update,
                MethodCall { resource_name: resource_name.to_string(), method: ResourceMethod::Update, id: Some(entity_id.to_string()), args: Value::Object(patch), options: CallOptions::default() },
            )
            .await?;
        Ok(())
    }

    pub async fn get_state(&self, machine_id: &str, entity_id: &str) -> EngineResult<Option<Value>> {
        self.state_store.get(&entity_key(machine_id, entity_id)).await
    }

    pub fn can_transition(&self, machine_id: &str, current_state: &str, event: &str) -> bool {
        self.machines.get(machine_id).and_then(|m| m.state(current_state).map(|s| s.on.contains_key(event))).unwrap_or(false)
    }

    pub fn get_valid_events(&self, machine_id: &str, current_state: &str) -> Vec<String> {
        self.machines.get(machine_id).map(|m| m.valid_events(current_state)).unwrap_or_default()
    }

    pub async fn initialize_entity(&self, machine_id: &str, entity_id: &str, context: Value) -> EngineResult<Value> {
        let machine = self.machines.get(machine_id).map(|m| m.clone()).ok_or_else(|| EngineError::RelatedResourceMissing { resource_name: machine_id.to_string() })?;
        let key = entity_key(machine_id, entity_id);
        if let Some(existing) = self.state_store.get(&key).await? {
            return Ok(existing);
        }
        let state = EntityState { current_state: machine.initial_state.clone(), context, last_transition: None, updated_at: Utc::now(), trigger_counts: Default::default() };
        let value = serde_json::to_value(&state).map_err(|e| EngineError::InvariantViolation { message: e.to_string() })?;
        self.state_store.put_indexed(&key, &value, "byState", &machine.initial_state).await?;
        Ok(value)
    }

    pub async fn get_transition_history(&self, machine_id: &str, entity_id: &str) -> EngineResult<Vec<Value>> {
        let records = self.transition_log.list_in_index("byMachine", machine_id).await?;
        Ok(records.into_iter().filter(|(_, v)| v.get("entityId").and_then(Value::as_str) == Some(entity_id)).map(|(_, v)| v).collect())
    }

    /// Waits until every in-flight event-triggered handler has completed.
    pub async fn wait_for_pending_events(&self, timeout: std::time::Duration) -> bool {
        self.core.events.quiesce(timeout).await
    }

    pub fn identity(&self) -> &resourcebase_plugin::PluginIdentity {
        &self.core.identity
    }

    /// Releases every cron job and event subscription registered while wiring
    /// machine triggers. Registered machines themselves are left in place;
    /// re-registering them after a subsequent `on_install` rewires their triggers.
    pub async fn teardown(&self) -> EngineResult<()> {
        self.core.teardown().await
    }
}

impl std::fmt::Debug for StateMachineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineEngine").field("machines", &self.machines.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::State;
    use resourcebase_core::InMemoryObjectStore;
    use resourcebase_plugin::{EventBus, PluginIdentity};

    #[derive(Default)]
    struct NoopCron;
    #[async_trait::async_trait]
    impl resourcebase_plugin::CronScheduler for NoopCron {
        async fn schedule(&self, _expr: &str, _handler: resourcebase_plugin::CronHandler, _timezone: Option<&str>) -> EngineResult<Uuid> {
            Ok(Uuid::new_v4())
        }
        async fn stop(&self, _job_id: Uuid) -> EngineResult<()> {
            Ok(())
        }
    }

    fn make_engine() -> Arc<StateMachineEngine> {
        let store = InMemoryObjectStore::shared();
        let core = Arc::new(PluginCore::new(PluginIdentity::new("state-machine"), store.clone(), Arc::new(EventBus::new()), Arc::new(NoopCron::default())));
        Arc::new(StateMachineEngine::new(core, store, 30, 2_000))
    }

    fn order_machine() -> Machine {
        Machine::new("order", "pending")
            .with_state(State::new("pending").on("ship", "shipped"))
            .with_state(State::new("shipped").on("deliver", "delivered").guard("deliver", "hasTrackingNumber"))
            .with_state(State::new("delivered").finalstate())
            .with_guard(
                "hasTrackingNumber",
                Arc::new(|ctx: Value, _event, _meta| Box::pin(async move { Ok(ctx.get("tracking").is_some()) })),
            )
    }

    #[tokio::test]
    async fn send_transitions_through_valid_events() {
        let engine = make_engine();
        engine.register_machine(order_machine()).await.unwrap();
        engine.initialize_entity("order", "o1", Value::Null).await.unwrap();

        let result = engine.send("order", "o1", "ship", serde_json::json!({"tracking": "t1"})).await.unwrap();
        assert_eq!(result["currentState"], "shipped");

        let result = engine.send("order", "o1", "deliver", Value::Null).await.unwrap();
        assert_eq!(result["currentState"], "delivered");
    }

    #[tokio::test]
    async fn send_rejects_an_event_not_valid_from_the_current_state() {
        let engine = make_engine();
        engine.register_machine(order_machine()).await.unwrap();
        engine.initialize_entity("order", "o1", Value::Null).await.unwrap();

        let err = engine.send("order", "o1", "deliver", Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn send_blocks_on_a_failing_guard() {
        let engine = make_engine();
        engine.register_machine(order_machine()).await.unwrap();
        engine.initialize_entity("order", "o1", Value::Null).await.unwrap();
        engine.send("order", "o1", "ship", Value::Null).await.unwrap();

        let err = engine.send("order", "o1", "deliver", Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::GuardBlocked { .. }));
    }

    #[tokio::test]
    async fn transition_history_records_every_hop() {
        let engine = make_engine();
        engine.register_machine(order_machine()).await.unwrap();
        engine.initialize_entity("order", "o1", Value::Null).await.unwrap();
        engine.send("order", "o1", "ship", serde_json::json!({"tracking": "t1"})).await.unwrap();

        let history = engine.get_transition_history("order", "o1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["event"], "ship");
    }
}
