use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::trace;

/// C3: in-process typed publish/subscribe. Plugin-scoped events are tagged
/// `plg:<slug>:<event>`; database-scoped events are tagged `db:<event>`.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque token identifying one `subscribe` call, returned so its owner can later
/// remove just that handler without disturbing other subscribers of the same event
/// name (the REDESIGN FLAGS directive against implicit cycles requires a plugin's
/// teardown to remove only its *own* subscriptions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<String, Vec<(u64, EventHandler)>>,
    next_token: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin_event(slug: &str, event: &str) -> String {
        format!("plg:{slug}:{event}")
    }

    pub fn db_event(event: &str) -> String {
        format!("db:{event}")
    }

    pub fn subscribe(&self, event_name: impl Into<String>, handler: EventHandler) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) as u64;
        self.handlers.entry(event_name.into()).or_default().push((token, handler));
        SubscriptionToken(token)
    }

    /// Removes a single subscription, leaving every other subscriber of `event_name`
    /// (including other plugins) intact.
    pub fn unsubscribe(&self, event_name: &str, token: SubscriptionToken) {
        if let Some(mut handlers) = self.handlers.get_mut(event_name) {
            handlers.retain(|(t, _)| *t != token.0);
        }
    }

    /// Removes every handler registered for `event_name`, regardless of owner.
    /// Callers that share event names across plugins should prefer
    /// [`EventBus::unsubscribe`] with the token from their own `subscribe` call.
    pub fn unsubscribe_all(&self, event_name: &str) {
        self.handlers.remove(event_name);
    }

    /// Dispatches to every handler registered for `event_name`, in registration order,
    /// and awaits their completion.
    pub async fn emit(&self, event_name: &str, payload: Value) {
        let handlers = self.handlers.get(event_name).map(|h| h.clone()).unwrap_or_default();
        trace!(event = event_name, handlers = handlers.len(), "emitting event");
        for (_, handler) in handlers {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            handler(payload.clone()).await;
            if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.drained.notify_waiters();
            }
        }
    }

    /// Spawns dispatch without waiting for handlers to finish; their completion is
    /// still tracked so [`EventBus::quiesce`] can observe it.
    pub fn emit_detached(self: &Arc<Self>, event_name: impl Into<String>, payload: Value) {
        let bus = self.clone();
        let event_name = event_name.into();
        tokio::spawn(async move {
            bus.emit(&event_name, payload).await;
        });
    }

    /// Explicit quiescence point: waits until every in-flight handler dispatched via
    /// [`EventBus::emit`]/[`EventBus::emit_detached`] has completed, or `timeout` elapses.
    pub async fn quiesce(&self, timeout: Duration) -> bool {
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            return true;
        }
        tokio::time::timeout(timeout, self.drained.notified()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn emit_dispatches_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::RwLock::new(Vec::new()));
        for label in ["a", "b"] {
            let order = order.clone();
            bus.subscribe(
                "plg:cache:evicted",
                Arc::new(move |_payload| {
                    let order = order.clone();
                    Box::pin(async move { order.write().push(label) })
                }),
            );
        }
        bus.emit("plg:cache:evicted", Value::Null).await;
        assert_eq!(*order.read(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_every_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(
            "db:shutdown",
            Arc::new(move |_p| {
                let hits = hits_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        bus.unsubscribe_all("db:shutdown");
        bus.emit("db:shutdown", Value::Null).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_its_own_token_leaving_other_subscribers_intact() {
        let bus = EventBus::new();
        let hits_a = Arc::new(AtomicU32::new(0));
        let hits_b = Arc::new(AtomicU32::new(0));
        let (hits_a_clone, hits_b_clone) = (hits_a.clone(), hits_b.clone());
        let token_a = bus.subscribe(
            "db:shutdown",
            Arc::new(move |_p| {
                let hits = hits_a_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        bus.subscribe(
            "db:shutdown",
            Arc::new(move |_p| {
                let hits = hits_b_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        bus.unsubscribe("db:shutdown", token_a);
        bus.emit("db:shutdown", Value::Null).await;
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quiesce_waits_for_detached_handlers() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicU32::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(
            "plg:ttl:swept",
            Arc::new(move |_p| {
                let hits = hits_clone.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        bus.emit_detached("plg:ttl:swept", Value::Null);
        let quiesced = bus.quiesce(Duration::from_millis(500)).await;
        assert!(quiesced);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
