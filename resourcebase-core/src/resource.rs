use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// C4: the fixed read/write method surface every engine installs middleware on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceMethod {
    Count,
    ListIds,
    GetMany,
    GetAll,
    Page,
    List,
    Get,
    Exists,
    Content,
    HasContent,
    Query,
    GetFromPartition,
    Insert,
    Update,
    Patch,
    Delete,
    DeleteMany,
    SetContent,
    DeleteContent,
    Replace,
}

impl ResourceMethod {
    /// The fixed set the cache engine installs read-through middleware on.
    pub const CACHEABLE_READS: &'static [ResourceMethod] = &[
        ResourceMethod::Count,
        ResourceMethod::ListIds,
        ResourceMethod::GetMany,
        ResourceMethod::GetAll,
        ResourceMethod::Page,
        ResourceMethod::List,
        ResourceMethod::Get,
        ResourceMethod::Exists,
        ResourceMethod::Content,
        ResourceMethod::HasContent,
        ResourceMethod::Query,
        ResourceMethod::GetFromPartition,
    ];

    /// The fixed set the cache engine installs invalidating middleware on.
    pub const INVALIDATING_WRITES: &'static [ResourceMethod] = &[
        ResourceMethod::Insert,
        ResourceMethod::Update,
        ResourceMethod::Delete,
        ResourceMethod::DeleteMany,
        ResourceMethod::SetContent,
        ResourceMethod::DeleteContent,
        ResourceMethod::Replace,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceMethod::Count => "count",
            ResourceMethod::ListIds => "listIds",
            ResourceMethod::GetMany => "getMany",
            ResourceMethod::GetAll => "getAll",
            ResourceMethod::Page => "page",
            ResourceMethod::List => "list",
            ResourceMethod::Get => "get",
            ResourceMethod::Exists => "exists",
            ResourceMethod::Content => "content",
            ResourceMethod::HasContent => "hasContent",
            ResourceMethod::Query => "query",
            ResourceMethod::GetFromPartition => "getFromPartition",
            ResourceMethod::Insert => "insert",
            ResourceMethod::Update => "update",
            ResourceMethod::Patch => "patch",
            ResourceMethod::Delete => "delete",
            ResourceMethod::DeleteMany => "deleteMany",
            ResourceMethod::SetContent => "setContent",
            ResourceMethod::DeleteContent => "deleteContent",
            ResourceMethod::Replace => "replace",
        }
    }
}

impl fmt::Display for ResourceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Call-time options; `skip_cache` bypasses every cache middleware when set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default)]
    pub skip_cache: bool,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub partition_values: HashMap<String, Value>,
}

/// A single invocation of a resource method, threaded through the middleware chain.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub resource_name: String,
    pub method: ResourceMethod,
    pub id: Option<String>,
    pub args: Value,
    pub options: CallOptions,
}

pub type HandlerFn = Arc<dyn Fn(MethodCall) -> BoxFuture<'static, EngineResult<Value>> + Send + Sync>;

/// A chainable middleware: `(next, call) -> result`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: MethodCall, next: HandlerFn) -> EngineResult<Value>;
}

#[async_trait]
impl<F> Middleware for F
where
    F: Fn(MethodCall, HandlerFn) -> BoxFuture<'static, EngineResult<Value>> + Send + Sync,
{
    async fn call(&self, ctx: MethodCall, next: HandlerFn) -> EngineResult<Value> {
        (self)(ctx, next).await
    }
}

/// A post-hook wrapper: `(result, call) -> result`, composed in insertion order.
#[async_trait]
pub trait PostHook: Send + Sync {
    async fn call(&self, result: Value, ctx: &MethodCall) -> EngineResult<Value>;
}

/// Append-only ordered middleware registry for a single resource.
///
/// The first registration for a method wraps the original handler; every later
/// registration for the same method is appended and walked left-to-right, i.e. the
/// first-registered middleware is outermost and runs first.
#[derive(Default)]
pub struct MiddlewareChain {
    layers: RwLock<HashMap<ResourceMethod, Vec<Arc<dyn Middleware>>>>,
    post_hooks: RwLock<HashMap<ResourceMethod, Vec<Arc<dyn PostHook>>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_middleware(&self, method: ResourceMethod, mw: Arc<dyn Middleware>) {
        self.layers.write().entry(method).or_default().push(mw);
    }

    pub fn use_post_hook(&self, method: ResourceMethod, hook: Arc<dyn PostHook>) {
        self.post_hooks.write().entry(method).or_default().push(hook);
    }

    /// Wrap `original` with every registered middleware/post-hook for `method`, outermost first.
    pub fn build(&self, method: ResourceMethod, original: HandlerFn) -> HandlerFn {
        let layers = self.layers.read().get(&method).cloned().unwrap_or_default();
        let mut handler = original;
        for mw in layers.into_iter().rev() {
            let inner = handler.clone();
            handler = Arc::new(move |ctx: MethodCall| {
                let mw = mw.clone();
                let inner = inner.clone();
                Box::pin(async move { mw.call(ctx, inner).await })
            });
        }
        let hooks = self.post_hooks.read().get(&method).cloned().unwrap_or_default();
        if hooks.is_empty() {
            return handler;
        }
        Arc::new(move |ctx: MethodCall| {
            let handler = handler.clone();
            let hooks = hooks.clone();
            Box::pin(async move {
                let ctx_for_hooks = ctx.clone();
                let mut result = handler(ctx).await?;
                for hook in &hooks {
                    result = hook.call(result, &ctx_for_hooks).await?;
                }
                Ok(result)
            })
        })
    }

    pub async fn invoke(&self, method: ResourceMethod, original: HandlerFn, ctx: MethodCall) -> EngineResult<Value> {
        self.build(method, original)(ctx).await
    }
}

/// Lifecycle events a resource emits; plugins subscribe via [`HookRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

pub type HookHandler = Arc<dyn Fn(&MethodCall, &Value) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// Multi-handler registry per `(resource, event)`.
#[derive(Default)]
pub struct HookRegistry {
    handlers: DashMap<ResourceEvent, Vec<HookHandler>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, event: ResourceEvent, handler: HookHandler) {
        self.handlers.entry(event).or_default().push(handler);
    }

    pub async fn fire(&self, event: ResourceEvent, ctx: &MethodCall, result: &Value) -> EngineResult<()> {
        let handlers = self.handlers.get(&event).map(|h| h.clone()).unwrap_or_default();
        for handler in handlers {
            handler(ctx, result).await?;
        }
        Ok(())
    }
}

/// Partition definition: a named derivation of one or more record fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatedBy {
    User,
    Plugin,
}

/// `$schema`: attributes are left opaque (validation is a non-goal here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub attributes: Value,
    pub partitions: Vec<PartitionDef>,
    pub timestamps: bool,
    pub created_by: CreatedBy,
}

/// C4: the resource contract engines consume. A concrete implementation owns its
/// object-store-backed handlers and exposes the middleware/hook registries so
/// plugins can install against it.
#[async_trait]
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> &ResourceSchema;
    fn middleware(&self) -> &MiddlewareChain;
    fn hooks(&self) -> &HookRegistry;

    /// The unmodified handler for `method`, prior to any middleware wrapping.
    fn original_handler(&self, method: ResourceMethod) -> HandlerFn;

    async fn call(&self, method: ResourceMethod, ctx: MethodCall) -> EngineResult<Value> {
        let original = self.original_handler(method);
        self.middleware().invoke(method, original, ctx).await
    }

    async fn get(&self, id: &str, options: CallOptions) -> EngineResult<Value> {
        self.call(
            ResourceMethod::Get,
            MethodCall { resource_name: self.name().to_string(), method: ResourceMethod::Get, id: Some(id.to_string()), args: Value::Null, options },
        )
        .await
    }

    async fn insert(&self, record: Value, options: CallOptions) -> EngineResult<Value> {
        self.call(
            ResourceMethod::Insert,
            MethodCall { resource_name: self.name().to_string(), method: ResourceMethod::Insert, id: None, args: record, options },
        )
        .await
    }

    async fn delete(&self, id: &str, options: CallOptions) -> EngineResult<Value> {
        self.call(
            ResourceMethod::Delete,
            MethodCall { resource_name: self.name().to_string(), method: ResourceMethod::Delete, id: Some(id.to_string()), args: Value::Null, options },
        )
        .await
    }
}

/// Helper constructor for boxed handler closures, used pervasively by test doubles
/// and the engines' internal resources.
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = EngineResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

pub fn not_found(resource_name: &str, id: &str) -> EngineError {
    EngineError::RelatedResourceMissing { resource_name: format!("{resource_name}:{id}") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_call(method: ResourceMethod) -> MethodCall {
        MethodCall { resource_name: "widgets".into(), method, id: None, args: Value::Null, options: CallOptions::default() }
    }

    struct CountingMiddleware {
        label: &'static str,
        order: Arc<RwLock<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn call(&self, ctx: MethodCall, next: HandlerFn) -> EngineResult<Value> {
            self.order.write().push(self.label);
            next(ctx).await
        }
    }

    #[tokio::test]
    async fn middleware_runs_left_to_right_in_registration_order() {
        let chain = MiddlewareChain::new();
        let order = Arc::new(RwLock::new(Vec::new()));
        chain.use_middleware(ResourceMethod::Get, Arc::new(CountingMiddleware { label: "a", order: order.clone() }));
        chain.use_middleware(ResourceMethod::Get, Arc::new(CountingMiddleware { label: "b", order: order.clone() }));

        let original = handler(|_ctx| async { Ok(Value::String("orig".into())) });
        let result = chain.invoke(ResourceMethod::Get, original, noop_call(ResourceMethod::Get)).await.unwrap();

        assert_eq!(result, Value::String("orig".into()));
        assert_eq!(*order.read(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn post_hooks_compose_in_insertion_order() {
        let chain = MiddlewareChain::new();
        struct AppendHook(&'static str);
        #[async_trait]
        impl PostHook for AppendHook {
            async fn call(&self, result: Value, _ctx: &MethodCall) -> EngineResult<Value> {
                let mut s = result.as_str().unwrap_or_default().to_string();
                s.push_str(self.0);
                Ok(Value::String(s))
            }
        }
        chain.use_post_hook(ResourceMethod::Get, Arc::new(AppendHook("-x")));
        chain.use_post_hook(ResourceMethod::Get, Arc::new(AppendHook("-y")));
        let original = handler(|_ctx| async { Ok(Value::String("base".into())) });
        let result = chain.invoke(ResourceMethod::Get, original, noop_call(ResourceMethod::Get)).await.unwrap();
        assert_eq!(result, Value::String("base-x-y".into()));
    }

    #[tokio::test]
    async fn hook_registry_fires_all_handlers_for_event() {
        let registry = HookRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            registry.add_hook(
                ResourceEvent::AfterInsert,
                Arc::new(move |_ctx, _result| {
                    let hits = hits.clone();
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            );
        }
        registry.fire(ResourceEvent::AfterInsert, &noop_call(ResourceMethod::Insert), &Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
