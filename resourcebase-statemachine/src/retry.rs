use std::sync::Arc;

use futures::future::BoxFuture;
use resourcebase_core::{EngineError, RetryPolicy};

pub type OnRetryHook = Arc<dyn Fn(u32, &EngineError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Names actions may be classified against. An error whose `Display` contains a
/// `non_retriable` entry is never retried even if [`resourcebase_core::EngineError::retriable`]
/// would say yes; an error matching a `retriable` entry is retried even if it
/// would not otherwise be. Neither list matching falls back to the error's own
/// `retriable()`.
#[derive(Clone, Default)]
pub struct RetryClassification {
    pub retriable: Vec<String>,
    pub non_retriable: Vec<String>,
}

impl RetryClassification {
    pub fn classify(&self, err: &EngineError) -> bool {
        let message = err.to_string();
        if self.non_retriable.iter().any(|p| message.contains(p.as_str())) {
            return false;
        }
        if self.retriable.iter().any(|p| message.contains(p.as_str())) {
            return true;
        }
        err.retriable()
    }
}

/// Per-action retry configuration, mergeable `global < machine < state`.
#[derive(Clone, Default)]
pub struct ActionRetryConfig {
    pub policy: Option<RetryPolicy>,
    pub classification: Option<RetryClassification>,
    pub on_retry: Option<OnRetryHook>,
}

impl ActionRetryConfig {
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_classification(mut self, classification: RetryClassification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_on_retry(mut self, hook: OnRetryHook) -> Self {
        self.on_retry = Some(hook);
        self
    }

    /// Merges `self` (global) with `machine` and `state` overrides, field by
    /// field, most-specific wins.
    pub fn merge(&self, machine: Option<&ActionRetryConfig>, state: Option<&ActionRetryConfig>) -> ActionRetryConfig {
        let mut out = self.clone();
        for layer in [machine, state].into_iter().flatten() {
            if layer.policy.is_some() {
                out.policy = layer.policy.clone();
            }
            if layer.classification.is_some() {
                out.classification = layer.classification.clone();
            }
            if layer.on_retry.is_some() {
                out.on_retry = layer.on_retry.clone();
            }
        }
        out
    }
}

/// Runs `action` under the merged retry config: NON_RETRIABLE errors (by
/// classification) abort immediately, RETRIABLE errors are retried up to
/// `policy.max_attempts`, sleeping `policy.delay_for_attempt` between tries.
/// `on_retry` errors are isolated (logged, never propagated).
pub async fn run_with_retry<F, Fut>(config: &ActionRetryConfig, mut action: F) -> Result<(), EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), EngineError>>,
{
    let policy = config.policy.clone().unwrap_or_default();
    let mut attempt = 0u32;
    loop {
        match action().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                let retriable = config.classification.as_ref().map(|c| c.classify(&e)).unwrap_or_else(|| e.retriable());
                attempt += 1;
                if !retriable || attempt >= policy.max_attempts {
                    return Err(e);
                }
                if let Some(hook) = &config.on_retry {
                    hook(attempt, &e).await;
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn non_retriable_classification_aborts_immediately() {
        let config = ActionRetryConfig::default()
            .with_policy(RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(1), ..Default::default() })
            .with_classification(RetryClassification { retriable: vec![], non_retriable: vec!["fatal".into()] });
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::InvariantViolation { message: "fatal misconfiguration".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retriable_classification_retries_until_success() {
        let config = ActionRetryConfig::default()
            .with_policy(RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(1), ..Default::default() })
            .with_classification(RetryClassification { retriable: vec!["transient".into()], non_retriable: vec![] });
        let calls = AtomicU32::new(0);
        let result = run_with_retry(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::InvariantViolation { message: "transient glitch".into() })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn merge_prefers_state_then_machine_then_global() {
        let global = ActionRetryConfig::default().with_policy(RetryPolicy { max_attempts: 1, ..Default::default() });
        let machine = ActionRetryConfig::default().with_policy(RetryPolicy { max_attempts: 2, ..Default::default() });
        let state = ActionRetryConfig::default().with_policy(RetryPolicy { max_attempts: 3, ..Default::default() });
        let merged = global.merge(Some(&machine), Some(&state));
        assert_eq!(merged.policy.unwrap().max_attempts, 3);

        let merged_machine_only = global.merge(Some(&machine), None);
        assert_eq!(merged_machine_only.policy.unwrap().max_attempts, 2);
    }
}
