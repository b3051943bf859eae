use std::time::Duration;

use rand::Rng;

/// Backoff shapes shared by the cache engine's invalidation retries and the state
/// machine's action retry classifier, so the jitter/cap math lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub kind: BackoffKind,
    /// Jitter applied as +/- this fraction of the computed delay (0.2 == +/-20%).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            kind: BackoffKind::Exponential,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = match self.kind {
            BackoffKind::Exponential => self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32),
            BackoffKind::Linear => self.base_delay.as_millis() as f64 * (attempt + 1) as f64,
            BackoffKind::Fixed => self.base_delay.as_millis() as f64,
        };
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jittered = apply_jitter(capped, self.jitter_fraction);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

fn apply_jitter(value: f64, fraction: f64) -> f64 {
    if fraction <= 0.0 {
        return value;
    }
    let mut rng = rand::thread_rng();
    let delta = value * fraction;
    value + rng.gen_range(-delta..=delta)
}

/// Runs `op` until it succeeds or `policy.max_attempts` is exhausted, sleeping
/// `policy.delay_for_attempt` between attempts. The last error is returned on
/// exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
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

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let policy = RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1), ..Default::default() };
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = retry_with_backoff(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok("done") } }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget_and_returns_last_error() {
        let policy = RetryPolicy { max_attempts: 2, base_delay: Duration::from_millis(1), ..Default::default() };
        let result: Result<&str, &str> = retry_with_backoff(&policy, || async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            kind: BackoffKind::Exponential,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(150));
    }
}
