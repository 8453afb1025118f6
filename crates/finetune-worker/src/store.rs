//! Store traits for the job record, the user's active-model pointer and the
//! connected mail account.
//!
//! The Postgres implementations live in [`crate::db`]. [`MemoryStore`] backs
//! the tests and follows the same compare-and-swap rules.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{FineTuningJob, JobStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;

/// Connected mail account with encrypted tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct MailAccount {
    pub id: Uuid,
    pub user_id: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The only User fields this pipeline may write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveModel {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub adapter_path: Option<String>,
    pub trained_at: Option<DateTime<Utc>>,
}

/// Outputs recorded on the job as stages finish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutputs {
    pub training_emails: Option<i32>,
    pub checkpoint_path: Option<String>,
    pub adapter_path: Option<String>,
    pub adapter_size: Option<i64>,
    pub model_name: Option<String>,
    pub actual_cost: Option<f64>,
}

/// A requested change to a job record, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub status: JobStatus,
    /// `None` keeps whatever progress is already recorded.
    pub progress: Option<i32>,
    pub step: Option<String>,
    pub error_message: Option<String>,
    pub outputs: JobOutputs,
}

impl JobTransition {
    pub fn to(status: JobStatus, progress: i32, step: impl Into<String>) -> Self {
        JobTransition {
            status,
            progress: Some(progress),
            step: Some(step.into()),
            error_message: None,
            outputs: JobOutputs::default(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        JobTransition {
            status: JobStatus::Failed,
            progress: None,
            step: Some(message.clone()),
            error_message: Some(message),
            outputs: JobOutputs::default(),
        }
    }

    pub fn with_outputs(mut self, outputs: JobOutputs) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Apply a transition to a job snapshot, enforcing the job invariants.
///
/// - the status change must be an edge of the state graph, or a same-status
///   progress update on a non-terminal job
/// - progress never decreases
/// - adapter path and model name are only written on COMPLETED
pub fn apply_transition(
    job: &FineTuningJob,
    change: &JobTransition,
    now: DateTime<Utc>,
) -> Result<FineTuningJob, StoreError> {
    let same_stage = change.status == job.status && !job.status.is_terminal();
    if !same_stage && !job.status.can_transition_to(change.status) {
        return Err(StoreError::InvalidTransition {
            id: job.id,
            from: job.status,
            to: change.status,
        });
    }

    let outputs = &change.outputs;
    if change.status != JobStatus::Completed
        && (outputs.adapter_path.is_some() || outputs.model_name.is_some())
    {
        return Err(StoreError::Invariant {
            id: job.id,
            reason: "adapter path and model name are only set on COMPLETED".to_string(),
        });
    }

    let mut next = job.clone();
    next.status = change.status;
    if let Some(progress) = change.progress {
        next.progress = progress.clamp(0, 100).max(job.progress);
    }
    if change.step.is_some() {
        next.current_step = change.step.clone();
    }
    if change.error_message.is_some() {
        next.error_message = change.error_message.clone();
    }
    if outputs.training_emails.is_some() {
        next.training_emails = outputs.training_emails;
    }
    if outputs.checkpoint_path.is_some() {
        next.checkpoint_path = outputs.checkpoint_path.clone();
    }
    if outputs.adapter_path.is_some() {
        next.adapter_path = outputs.adapter_path.clone();
    }
    if outputs.adapter_size.is_some() {
        next.adapter_size = outputs.adapter_size;
    }
    if outputs.model_name.is_some() {
        next.model_name = outputs.model_name.clone();
    }
    if outputs.actual_cost.is_some() {
        next.actual_cost = outputs.actual_cost;
    }
    if change.status == JobStatus::Completed {
        next.deployed_at = Some(now);
    }
    next.updated_at = now;

    Ok(next)
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, user_id: &str, base_model: &str) -> Result<FineTuningJob, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError>;

    /// The oldest PENDING job by creation time whose user has no other
    /// claimed, non-terminal job.
    async fn oldest_pending(&self) -> Result<Option<FineTuningJob>, StoreError>;

    /// Claimed, non-terminal jobs (for the stall watchdog).
    async fn list_in_progress(&self) -> Result<Vec<FineTuningJob>, StoreError>;

    /// Atomically move a job out of PENDING into EXTRACTING_DATA.
    ///
    /// Returns `None` when the job is no longer PENDING, or when the same
    /// user already has another claimed, non-terminal job.
    async fn claim(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError>;

    /// Atomic read-modify-write of a job record via [`apply_transition`].
    async fn transition(
        &self,
        job_id: Uuid,
        change: JobTransition,
    ) -> Result<FineTuningJob, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn active_model(&self, user_id: &str) -> Result<Option<ActiveModel>, StoreError>;

    /// Overwrite exactly the active-model pointer fields in one write.
    async fn set_active_model(&self, user_id: &str, model: &ActiveModel)
        -> Result<(), StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn mail_account(&self, user_id: &str) -> Result<Option<MailAccount>, StoreError>;

    /// Rewrite the access token and expiry in place. Never touches the
    /// refresh token.
    async fn update_access_token(
        &self,
        account_id: Uuid,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub(crate) const CLAIM_PROGRESS: i32 = 5;
pub(crate) const CLAIM_STEP: &str = "Claimed by worker";

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, FineTuningJob>,
    users: HashMap<String, ActiveModel>,
    accounts: HashMap<Uuid, MailAccount>,
}

impl MemoryState {
    /// Whether the job's owner already has another claimed, non-terminal job.
    fn user_busy(&self, job: &FineTuningJob) -> bool {
        self.jobs.values().any(|other| {
            other.id != job.id
                && other.user_id == job.user_id
                && other.status != JobStatus::Pending
                && !other.status.is_terminal()
        })
    }
}

/// In-process implementation of all three stores.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_job(&self, job: FineTuningJob) {
        self.state.lock().await.jobs.insert(job.id, job);
    }

    pub async fn insert_user(&self, user_id: &str, model: ActiveModel) {
        self.state
            .lock()
            .await
            .users
            .insert(user_id.to_string(), model);
    }

    pub async fn insert_account(&self, account: MailAccount) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn account(&self, account_id: Uuid) -> Option<MailAccount> {
        self.state.lock().await.accounts.get(&account_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, user_id: &str, base_model: &str) -> Result<FineTuningJob, StoreError> {
        let job = FineTuningJob::new_pending(user_id, base_model);
        self.insert_job(job.clone()).await;
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn oldest_pending(&self) -> Result<Option<FineTuningJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| !state.user_busy(job))
            .min_by_key(|job| job.created_at)
            .cloned())
    }

    async fn list_in_progress(&self) -> Result<Vec<FineTuningJob>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal() && job.status != JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.updated_at);
        Ok(jobs)
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        let mut state = self.state.lock().await;
        let job = match state.jobs.get(&job_id) {
            Some(job) if job.status == JobStatus::Pending => job.clone(),
            _ => return Ok(None),
        };

        if state.user_busy(&job) {
            return Ok(None);
        }

        let claimed = apply_transition(
            &job,
            &JobTransition::to(JobStatus::ExtractingData, CLAIM_PROGRESS, CLAIM_STEP),
            Utc::now(),
        )?;
        state.jobs.insert(job_id, claimed.clone());
        Ok(Some(claimed))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        change: JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| StoreError::not_found("Job", job_id))?;
        let next = apply_transition(job, &change, Utc::now())?;
        state.jobs.insert(job_id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn active_model(&self, user_id: &str) -> Result<Option<ActiveModel>, StoreError> {
        Ok(self.state.lock().await.users.get(user_id).cloned())
    }

    async fn set_active_model(
        &self,
        user_id: &str,
        model: &ActiveModel,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| StoreError::not_found("User", user_id))?;
        *slot = model.clone();
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn mail_account(&self, user_id: &str) -> Result<Option<MailAccount>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.user_id == user_id)
            .cloned())
    }

    async fn update_access_token(
        &self,
        account_id: Uuid,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::not_found("Account", account_id))?;
        account.access_token = Some(access_token.to_string());
        account.expires_at = Some(expires_at);
        Ok(())
    }
}
