//! C9: a guarded state machine engine layered over the resourcebase plugin core.
//! `engine::StateMachineEngine::send` runs the nine-step locked transition
//! protocol; `trigger` wires cron/date/function/event-driven automatic
//! transitions; `retry` classifies and backs off action failures.

pub mod engine;
pub mod machine;
pub mod plugin;
pub mod retry;
pub mod trigger;

pub use engine::StateMachineEngine;
pub use machine::{ActionFn, EntityState, GuardFn, Machine, State, TransitionMeta, TransitionRecord};
pub use plugin::StateMachinePlugin;
pub use retry::{ActionRetryConfig, OnRetryHook, RetryClassification};
pub use trigger::{ConditionFn, DynamicEventName, EventSource, TriggerConfig, TriggerEffect, TriggerSource};
