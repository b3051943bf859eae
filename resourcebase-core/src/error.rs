use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Root error type surfaced at plugin boundaries.
///
/// Mirrors the user-visible error shape required of every engine: a plugin name,
/// the operation that failed, whether retrying is sane, and an operator-facing
/// suggestion.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("configuration invalid for plugin {plugin_name}: {message}")]
    ConfigurationInvalid { plugin_name: String, message: String },

    #[error("related resource missing: {resource_name}")]
    RelatedResourceMissing { resource_name: String },

    #[error("guard blocked transition: {message}")]
    GuardBlocked { message: String },

    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("verification failed: {message}")]
    VerificationFailed { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn configuration_invalid(plugin_name: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ConfigurationInvalid { plugin_name: plugin_name.into(), message: message.into() }
    }

    /// Whether a caller may reasonably retry the operation that produced this error.
    pub fn retriable(&self) -> bool {
        match self {
            EngineError::ObjectStore(e) => e.retriable(),
            EngineError::Lock(LockError::Contention { .. }) => true,
            EngineError::ConfigurationInvalid { .. } => false,
            EngineError::RelatedResourceMissing { .. } => false,
            EngineError::GuardBlocked { .. } => false,
            EngineError::InvariantViolation { .. } => false,
            EngineError::VerificationFailed { .. } => false,
            EngineError::Other(_) => false,
        }
    }

    /// One-sentence operator remediation, used to populate `UserVisibleError::suggestion`.
    pub fn suggestion(&self) -> String {
        match self {
            EngineError::ObjectStore(ObjectStoreError::NotFound { .. }) => {
                "verify the key exists before reading; this may be an expected cache miss".into()
            }
            EngineError::ObjectStore(ObjectStoreError::Transient { .. }) => {
                "retry with backoff; the object store reported a transient failure".into()
            }
            EngineError::Lock(LockError::Contention { .. }) => {
                "increase lockTimeout or investigate the holder for a stuck transition".into()
            }
            EngineError::ConfigurationInvalid { .. } => {
                "fix the plugin configuration before the next install".into()
            }
            EngineError::RelatedResourceMissing { .. } => {
                "create the referenced resource before enabling this plugin".into()
            }
            EngineError::GuardBlocked { .. } => "the transition's precondition was not met".into(),
            EngineError::InvariantViolation { .. } => "the requested event is not valid from the current state".into(),
            EngineError::VerificationFailed { .. } => "re-run verification after investigating data integrity".into(),
            EngineError::Other(_) => "inspect the wrapped error for details".into(),
        }
    }

    pub fn into_user_visible(self, plugin_name: impl Into<String>, operation: impl Into<String>) -> UserVisibleError {
        let retriable = self.retriable();
        let suggestion = self.suggestion();
        UserVisibleError {
            plugin_name: plugin_name.into(),
            operation: operation.into(),
            status_code: status_code_for(&self),
            retriable,
            suggestion,
            metadata: HashMap::new(),
            source: self.to_string(),
        }
    }
}

fn status_code_for(err: &EngineError) -> u16 {
    match err {
        EngineError::ObjectStore(ObjectStoreError::NotFound { .. }) => 404,
        EngineError::ObjectStore(ObjectStoreError::Transient { .. }) => 503,
        EngineError::Lock(LockError::Contention { .. }) => 409,
        EngineError::ConfigurationInvalid { .. } => 400,
        EngineError::RelatedResourceMissing { .. } => 424,
        EngineError::GuardBlocked { .. } => 412,
        EngineError::InvariantViolation { .. } => 409,
        EngineError::VerificationFailed { .. } => 422,
        EngineError::Other(_) => 500,
    }
}

/// `{pluginName, operation, statusCode, retriable, suggestion, metadata}` per the
/// error handling design: the shape every caller ultimately receives.
#[derive(Debug, Clone, Serialize)]
pub struct UserVisibleError {
    pub plugin_name: String,
    pub operation: String,
    pub status_code: u16,
    pub retriable: bool,
    pub suggestion: String,
    pub metadata: HashMap<String, String>,
    pub source: String,
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("no such key: {key}")]
    NotFound { key: String },

    #[error("conditional write rejected for key: {key}")]
    PreconditionFailed { key: String },

    #[error("transient object store failure: {message}")]
    Transient { message: String },

    #[error("object store backend error: {0}")]
    Backend(String),
}

impl ObjectStoreError {
    pub fn retriable(&self) -> bool {
        matches!(self, ObjectStoreError::Transient { .. })
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock '{name}' contended, timed out after {timeout_ms}ms")]
    Contention { name: String, timeout_ms: u64 },

    #[error("lock '{name}' not held by owner '{owner}'")]
    NotOwner { name: String, owner: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
