use std::sync::Arc;
use std::str::FromStr;

use async_trait::async_trait;
use chrono_tz::Tz;
use futures::future::BoxFuture;
use resourcebase_core::{EngineError, EngineResult};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub type CronJobId = Uuid;
pub type CronHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// C6: the cron contract plugins schedule against. Implementations only need to
/// guarantee a tick invokes the handler and `stop` prevents further invocations;
/// overlap between two ticks of the same job is the handler's own responsibility
/// to guard (see the TTL sweeper's `isRunning` flag). `timezone` is an optional
/// IANA zone name (e.g. `"America/New_York"`); `None` schedules against UTC.
#[async_trait]
pub trait CronScheduler: Send + Sync {
    async fn schedule(&self, expr: &str, handler: CronHandler, timezone: Option<&str>) -> EngineResult<CronJobId>;
    async fn stop(&self, job_id: CronJobId) -> EngineResult<()>;
}

/// `tokio-cron-scheduler`-backed implementation.
pub struct TokioCronScheduler {
    inner: JobScheduler,
}

impl TokioCronScheduler {
    pub async fn new() -> EngineResult<Self> {
        let inner = JobScheduler::new().await.map_err(|e| anyhow::anyhow!("failed to start cron scheduler: {e}"))?;
        inner.start().await.map_err(|e| anyhow::anyhow!("failed to start cron scheduler loop: {e}"))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl CronScheduler for TokioCronScheduler {
    async fn schedule(&self, expr: &str, handler: CronHandler, timezone: Option<&str>) -> EngineResult<CronJobId> {
        let expr_owned = expr.to_string();
        let job = match timezone {
            Some(tz_name) => {
                let tz = Tz::from_str(tz_name).map_err(|_| EngineError::configuration_invalid("cron", format!("unknown IANA timezone '{tz_name}'")))?;
                Job::new_async_tz(expr, tz, move |_uuid, _lock| {
                    let handler = handler.clone();
                    Box::pin(async move { handler().await })
                })
            }
            None => Job::new_async(expr, move |_uuid, _lock| {
                let handler = handler.clone();
                Box::pin(async move { handler().await })
            }),
        }
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr_owned}': {e}"))?;

        let id = self.inner.add(job).await.map_err(|e| anyhow::anyhow!("failed to register cron job: {e}"))?;
        info!(job_id = %id, expr, ?timezone, "cron job scheduled");
        Ok(id)
    }

    async fn stop(&self, job_id: CronJobId) -> EngineResult<()> {
        match self.inner.remove(&job_id).await {
            Ok(()) => {
                info!(job_id = %job_id, "cron job stopped");
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to stop cron job");
                Err(anyhow::anyhow!("failed to stop cron job {job_id}: {e}").into())
            }
        }
    }
}
