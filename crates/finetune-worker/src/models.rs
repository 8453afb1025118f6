// Database models for Diesel
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared_types::{FineTuningJob, JobStatus};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ActiveModel, MailAccount};

/// Database representation of fine_tuning_jobs.
/// Status is stored as VARCHAR using the SCREAMING_SNAKE_CASE wire names.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = crate::schema::fine_tuning_jobs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct JobRow {
    pub id: Uuid,
    pub user_id: String,
    pub status: String,
    pub progress: i32,
    pub current_step: Option<String>,
    pub error_message: Option<String>,
    pub base_model: String,
    pub training_emails: Option<i32>,
    pub checkpoint_path: Option<String>,
    pub adapter_path: Option<String>,
    pub adapter_size: Option<i64>,
    pub model_name: Option<String>,
    pub actual_cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for FineTuningJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(format!("job {}: {}", row.id, e)))?;

        Ok(FineTuningJob {
            id: row.id,
            user_id: row.user_id,
            status,
            progress: row.progress,
            current_step: row.current_step,
            error_message: row.error_message,
            base_model: row.base_model,
            training_emails: row.training_emails,
            checkpoint_path: row.checkpoint_path,
            adapter_path: row.adapter_path,
            adapter_size: row.adapter_size,
            model_name: row.model_name,
            actual_cost: row.actual_cost,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deployed_at: row.deployed_at,
        })
    }
}

/// Insertable struct for new jobs
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::fine_tuning_jobs)]
pub struct NewJob<'a> {
    pub user_id: &'a str,
    pub status: &'a str,
    pub progress: i32,
    pub base_model: &'a str,
}

/// Full-row write used by the compare-and-swap update in `db::jobs`.
///
/// `None` fields are skipped by Diesel; job outputs are only ever set,
/// never cleared, so skipping them is equivalent to rewriting them.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::fine_tuning_jobs)]
pub struct JobChanges<'a> {
    pub status: &'a str,
    pub progress: i32,
    pub current_step: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub training_emails: Option<i32>,
    pub checkpoint_path: Option<&'a str>,
    pub adapter_path: Option<&'a str>,
    pub adapter_size: Option<i64>,
    pub model_name: Option<&'a str>,
    pub actual_cost: Option<f64>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
}

impl<'a> From<&'a FineTuningJob> for JobChanges<'a> {
    fn from(job: &'a FineTuningJob) -> Self {
        JobChanges {
            status: job.status.as_str(),
            progress: job.progress,
            current_step: job.current_step.as_deref(),
            error_message: job.error_message.as_deref(),
            training_emails: job.training_emails,
            checkpoint_path: job.checkpoint_path.as_deref(),
            adapter_path: job.adapter_path.as_deref(),
            adapter_size: job.adapter_size,
            model_name: job.model_name.as_deref(),
            actual_cost: job.actual_cost,
            updated_at: job.updated_at,
            deployed_at: job.deployed_at,
        }
    }
}

/// The connected mail account columns this worker reads.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AccountRow {
    pub id: Uuid,
    pub user_id: String,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<AccountRow> for MailAccount {
    fn from(row: AccountRow) -> Self {
        MailAccount {
            id: row.id,
            user_id: row.user_id,
            refresh_token: row.refresh_token,
            access_token: row.access_token,
            expires_at: row.expires_at,
        }
    }
}

/// The active-model pointer columns of `users`. Nothing else on that table
/// is mapped here.
#[derive(Debug, Clone, Queryable, Selectable, AsChangeset)]
#[diesel(table_name = crate::schema::users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub struct ActiveModelRow {
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub finetuned_adapter_path: Option<String>,
    pub finetuned_at: Option<DateTime<Utc>>,
}

impl From<ActiveModelRow> for ActiveModel {
    fn from(row: ActiveModelRow) -> Self {
        ActiveModel {
            provider: row.ai_provider,
            model: row.ai_model,
            adapter_path: row.finetuned_adapter_path,
            trained_at: row.finetuned_at,
        }
    }
}

impl From<&ActiveModel> for ActiveModelRow {
    fn from(model: &ActiveModel) -> Self {
        ActiveModelRow {
            ai_provider: model.provider.clone(),
            ai_model: model.model.clone(),
            finetuned_adapter_path: model.adapter_path.clone(),
            finetuned_at: model.trained_at,
        }
    }
}
