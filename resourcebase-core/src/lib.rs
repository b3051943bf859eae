//! Object-store contract, resource middleware core, error taxonomy and shared
//! configuration for the resourcebase engines.

pub mod config;
pub mod error;
pub mod internal_store;
pub mod object_store;
pub mod resource;
pub mod retry;

pub use config::RootConfig;
pub use error::{EngineError, EngineResult, UserVisibleError};
pub use internal_store::InternalStore;
pub use object_store::{InMemoryObjectStore, ObjectStoreClient};
pub use resource::{
    CallOptions, HandlerFn, HookHandler, HookRegistry, MethodCall, Middleware, MiddlewareChain, PostHook, Resource,
    ResourceEvent, ResourceMethod, ResourceSchema,
};
pub use retry::{retry_with_backoff, BackoffKind, RetryPolicy};
