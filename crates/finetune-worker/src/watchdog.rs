//! Fails claimed jobs whose record has not moved for too long.

use chrono::{DateTime, Duration, Utc};
use shared_types::{FineTuningJob, JobStatus};
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::tracker::JobTracker;

/// Maximum time a job may sit in one stage without an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallLimits {
    pub default_minutes: i64,
    pub training_minutes: i64,
}

impl StallLimits {
    pub fn for_status(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Training => self.training_minutes,
            _ => self.default_minutes,
        }
    }
}

fn is_stalled(job: &FineTuningJob, limits: &StallLimits, now: DateTime<Utc>) -> bool {
    now - job.updated_at > Duration::minutes(limits.for_status(job.status))
}

/// Fail every stalled job. Returns the jobs that were failed.
pub async fn sweep_stalled(
    tracker: &JobTracker,
    limits: StallLimits,
    now: DateTime<Utc>,
) -> Result<Vec<FineTuningJob>, StoreError> {
    let mut failed = Vec::new();

    for job in tracker.store().list_in_progress().await? {
        if !is_stalled(&job, &limits, now) {
            continue;
        }

        let minutes = limits.for_status(job.status);
        let message = format!("Stalled in {} for more than {} minutes", job.status, minutes);
        tracing::warn!(job_id = %job.id, status = %job.status, "{}", message);

        match tracker.fail(job.id, message).await {
            Ok(job) => failed.push(job),
            // Finished or failed by its worker since the listing.
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(failed)
}

/// Sweep on its own interval, independent of whatever job the poller is
/// running. Abort the handle to stop it.
pub fn spawn_sweeper(
    tracker: JobTracker,
    limits: StallLimits,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match sweep_stalled(&tracker, limits, Utc::now()).await {
                Ok(failed) if !failed.is_empty() => {
                    tracing::warn!(count = failed.len(), "Failed stalled jobs");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Stall sweep failed: {}", e),
            }
        }
    })
}
