//! Job state changes paired with status notifications.

use std::sync::Arc;

use shared_types::{FineTuningJob, JobStatus, JobUpdate};
use uuid::Uuid;

use crate::error::StoreError;
use crate::reporter::StatusReporter;
use crate::store::{JobStore, JobTransition};

/// Persists job changes, then notifies the reporter. Notification never
/// blocks and never fails the caller.
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<dyn JobStore>,
    reporter: Arc<dyn StatusReporter>,
}

impl JobTracker {
    pub fn new(jobs: Arc<dyn JobStore>, reporter: Arc<dyn StatusReporter>) -> Self {
        Self { jobs, reporter }
    }

    pub fn store(&self) -> &dyn JobStore {
        self.jobs.as_ref()
    }

    fn publish(&self, job: &FineTuningJob) {
        self.reporter.notify(JobUpdate::from(job));
    }

    pub async fn create(&self, user_id: &str, base_model: &str) -> Result<FineTuningJob, StoreError> {
        let job = self.jobs.create(user_id, base_model).await?;
        tracing::info!(job_id = %job.id, user_id = %user_id, "Created fine-tuning job");
        self.publish(&job);
        Ok(job)
    }

    pub async fn claim(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        let claimed = self.jobs.claim(job_id).await?;
        if let Some(job) = &claimed {
            tracing::info!(job_id = %job.id, user_id = %job.user_id, "Claimed job");
            self.publish(job);
        }
        Ok(claimed)
    }

    pub async fn record(
        &self,
        job_id: Uuid,
        change: JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        let job = self.jobs.transition(job_id, change).await?;
        tracing::debug!(
            job_id = %job.id,
            status = %job.status,
            progress = job.progress,
            step = job.current_step.as_deref().unwrap_or_default(),
            "Job updated"
        );
        self.publish(&job);
        Ok(job)
    }

    pub async fn advance(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: i32,
        step: impl Into<String>,
    ) -> Result<FineTuningJob, StoreError> {
        self.record(job_id, JobTransition::to(status, progress, step)).await
    }

    /// Apply a stage transition. When the job is already at or past that
    /// stage (a recovered job being re-run) the status is left as it is and
    /// only the step, progress and outputs are written.
    pub async fn enter(
        &self,
        job_id: Uuid,
        mut change: JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        let current = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Job", job_id))?;

        let stages = (current.status.stage_index(), change.status.stage_index());
        if let (Some(at), Some(wanted)) = stages {
            if at >= wanted {
                change.status = current.status;
            }
        }
        self.record(job_id, change).await
    }

    /// Mark the job FAILED, keeping whatever progress it had reached.
    pub async fn fail(
        &self,
        job_id: Uuid,
        message: impl Into<String>,
    ) -> Result<FineTuningJob, StoreError> {
        self.record(job_id, JobTransition::failed(message)).await
    }

    /// Cancel a job that has not been claimed yet. For any other state this
    /// is a no-op that returns the current record.
    pub async fn cancel(&self, job_id: Uuid) -> Result<FineTuningJob, StoreError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Job", job_id))?;

        if job.status != JobStatus::Pending {
            tracing::info!(
                job_id = %job_id,
                status = %job.status,
                "Cancellation ignored; job is no longer pending"
            );
            return Ok(job);
        }

        let change = JobTransition::to(JobStatus::Cancelled, job.progress, "Cancelled by user");
        match self.record(job_id, change).await {
            Ok(job) => Ok(job),
            // Claimed between the read and the write.
            Err(StoreError::InvalidTransition { .. }) | Err(StoreError::Conflict(_)) => self
                .jobs
                .get(job_id)
                .await?
                .ok_or_else(|| StoreError::not_found("Job", job_id)),
            Err(e) => Err(e),
        }
    }
}
