use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::CatalogConfig;
use crate::jobs::{JobCommand, JobRunner};
use crate::orchestrator::SyncIntent;
use crate::SyncError;

/// Periodic full sync through the job runner, so scheduled runs get the same
/// retries as requested ones. Returns `None` when scheduling is disabled.
pub async fn build_scheduler(
    config: &CatalogConfig,
    runner: JobRunner,
) -> Result<Option<JobScheduler>, SyncError> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await?;
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            let handle = runner.enqueue(JobCommand::Sync(SyncIntent::SyncAll)).await;
            info!(job_id = %handle.id, "scheduled catalog sync enqueued");
        })
    })?;
    sched.add(job).await?;
    info!(cron = %config.sync_cron, "catalog sync scheduled");
    Ok(Some(sched))
}
