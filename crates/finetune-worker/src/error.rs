//! Error taxonomy for the fine-tuning pipeline.
//!
//! Every stage returns one of the stage-specific errors below. They all
//! convert into [`PipelineError`], which is what the job-processing boundary
//! in [`crate::pipeline`] catches and writes into the FAILED job record.

use std::path::PathBuf;

use shared_types::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Job store / user store / account store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection pool error
    #[error("Database connection error: {0}")]
    ConnectionPool(String),

    /// Database query error
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} violates an invariant: {reason}")]
    Invariant { id: Uuid, reason: String },

    /// Compare-and-swap lost against a concurrent writer.
    #[error("Job {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        StoreError::ConnectionPool(err.to_string())
    }
}

/// Decryption or refresh failures for the connected mail account.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No connected mail account for user {0}")]
    NoAccount(String),

    #[error("Account {0} has no stored refresh token")]
    MissingRefreshToken(Uuid),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Token decryption failed: authentication tag mismatch")]
    Decrypt,

    #[error("Token encryption failed")]
    Encrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Token refresh rejected with HTTP {status}: {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("Token refresh request failed: {0}")]
    RefreshRequest(#[from] reqwest::Error),

    #[error("Account store error: {0}")]
    Account(#[from] StoreError),
}

/// Training subprocess and checkpoint failures.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Failed to start training command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Training exited with {}: {summary}", exit_label(.code))]
    Exit { code: Option<i32>, summary: String },

    #[error("Checkpoint at {} is missing {missing}", .path.display())]
    MissingArtifact { path: PathBuf, missing: String },

    #[error("Training I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Adapter registration and user-pointer failures.
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Failed to start deployment command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Deployment exited with {}: {summary}", exit_label(.code))]
    Exit { code: Option<i32>, summary: String },

    #[error("Deployment I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to update active model for user: {0}")]
    UserUpdate(#[source] StoreError),

    #[error("Adapter size of {0} bytes cannot be recorded on the job")]
    AdapterTooLarge(u64),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

/// Everything that can end a job. Caught once, at the job boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Job or user not found, or the job is not processable.
    #[error("{0}")]
    Configuration(String),

    #[error("Only {found} usable training emails found; a minimum of {required} is required")]
    Eligibility { found: usize, required: usize },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("{0}")]
    Extraction(String),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job was failed or cancelled by someone else while it ran.
    #[error("Job was marked {0} while running")]
    Stopped(JobStatus),
}

impl PipelineError {
    /// Taxonomy name recorded in the job's error message.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "ConfigurationError",
            PipelineError::Eligibility { .. } => "EligibilityError",
            PipelineError::Credential(_) => "CredentialError",
            PipelineError::Extraction(_) => "ExtractionError",
            PipelineError::Training(_) => "TrainingError",
            PipelineError::Deployment(_) => "DeploymentError",
            PipelineError::Store(_) => "DatabaseError",
            PipelineError::Io(_) => "IoError",
            PipelineError::Stopped(_) => "StoppedError",
        }
    }

    /// Human-readable message stored on the FAILED job.
    pub fn job_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
