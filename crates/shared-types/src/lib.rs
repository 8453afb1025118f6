use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Job Status
// ============================================================================

/// Lifecycle status of a fine-tuning job.
///
/// The pipeline stages run strictly in declaration order, from `Pending` to
/// `Completed`. `Failed` can be entered from any non-terminal state and
/// `Cancelled` only from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    ExtractingData,
    PreparingData,
    Training,
    Evaluating,
    Deploying,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::ExtractingData,
        JobStatus::PreparingData,
        JobStatus::Training,
        JobStatus::Evaluating,
        JobStatus::Deploying,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::ExtractingData => "EXTRACTING_DATA",
            JobStatus::PreparingData => "PREPARING_DATA",
            JobStatus::Training => "TRAINING",
            JobStatus::Evaluating => "EVALUATING",
            JobStatus::Deploying => "DEPLOYING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position along the happy path. `None` for `Failed` and `Cancelled`.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::ExtractingData => Some(1),
            JobStatus::PreparingData => Some(2),
            JobStatus::Training => Some(3),
            JobStatus::Evaluating => Some(4),
            JobStatus::Deploying => Some(5),
            JobStatus::Completed => Some(6),
            JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// The next stage on the happy path.
    pub fn next_stage(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Pending => Some(JobStatus::ExtractingData),
            JobStatus::ExtractingData => Some(JobStatus::PreparingData),
            JobStatus::PreparingData => Some(JobStatus::Training),
            JobStatus::Training => Some(JobStatus::Evaluating),
            JobStatus::Evaluating => Some(JobStatus::Deploying),
            JobStatus::Deploying => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// Whether `self -> target` is an edge of the job state graph.
    ///
    /// Self-loops are not edges; progress updates within a stage are handled
    /// by the store, not by this graph.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            JobStatus::Failed => true,
            JobStatus::Cancelled => *self == JobStatus::Pending,
            _ => self.next_stage() == Some(target),
        }
    }

    /// Every status with an edge into `target`.
    pub fn predecessors(target: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownJobStatus(pub String);

impl fmt::Display for UnknownJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status: {}", self.0)
    }
}

impl std::error::Error for UnknownJobStatus {}

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownJobStatus(s.to_string()))
    }
}

// ============================================================================
// Fine-Tuning Job
// ============================================================================

/// One training attempt for one user. Canonical storage and wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FineTuningJob {
    pub id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
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

impl FineTuningJob {
    /// A fresh PENDING job, as the settings page would create it.
    pub fn new_pending(user_id: impl Into<String>, base_model: impl Into<String>) -> Self {
        let now = Utc::now();
        FineTuningJob {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            progress: 0,
            current_step: None,
            error_message: None,
            base_model: base_model.into(),
            training_emails: None,
            checkpoint_path: None,
            adapter_path: None,
            adapter_size: None,
            model_name: None,
            actual_cost: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        }
    }
}

/// Webhook notification body.
///
/// Consumers must treat the job record as the source of truth: delivery and
/// ordering of these notifications are not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_emails: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
}

impl From<&FineTuningJob> for JobUpdate {
    fn from(job: &FineTuningJob) -> Self {
        JobUpdate {
            job_id: job.id,
            status: Some(job.status),
            progress: Some(job.progress),
            current_step: job.current_step.clone(),
            error_message: job.error_message.clone(),
            model_name: job.model_name.clone(),
            training_emails: job.training_emails,
            checkpoint_path: job.checkpoint_path.clone(),
            adapter_path: job.adapter_path.clone(),
            adapter_size: job.adapter_size,
            actual_cost: job.actual_cost,
        }
    }
}

// ============================================================================
// Training Data
// ============================================================================

/// One Alpaca-style training triple derived from a single sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction: String,
    pub input: String,
    pub output: String,
}

/// Summary written next to the dataset for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_examples: usize,
    pub train_examples: usize,
    pub val_examples: usize,
    pub avg_output_length: usize,
    pub min_output_length: usize,
    pub max_output_length: usize,
    pub reply_emails: usize,
    pub forward_emails: usize,
    pub new_emails: usize,
}

/// Fixed LoRA hyperparameter profile handed to the training routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingProfile {
    pub model_max_length: u32,
    pub lora_r: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
    pub use_4bit: bool,
    pub num_train_epochs: u32,
    pub per_device_train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub warmup_ratio: f64,
    pub lr_scheduler_type: String,
}

impl Default for TrainingProfile {
    fn default() -> Self {
        TrainingProfile {
            model_max_length: 2048,
            lora_r: 16,
            lora_alpha: 32,
            lora_dropout: 0.05,
            use_4bit: true,
            num_train_epochs: 3,
            per_device_train_batch_size: 4,
            gradient_accumulation_steps: 4,
            learning_rate: 2e-4,
            warmup_ratio: 0.03,
            lr_scheduler_type: "cosine".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_edges() {
        let mut status = JobStatus::Pending;
        let mut visited = vec![status];
        while let Some(next) = status.next_stage() {
            assert!(status.can_transition_to(next));
            status = next;
            visited.push(status);
        }
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(visited.len(), 7);
    }

    #[test]
    fn test_no_stage_skipping() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::PreparingData));
        assert!(!JobStatus::ExtractingData.can_transition_to(JobStatus::Training));
        assert!(!JobStatus::Training.can_transition_to(JobStatus::Deploying));
        assert!(!JobStatus::Deploying.can_transition_to(JobStatus::Evaluating));
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for status in JobStatus::ALL {
            assert_eq!(
                status.can_transition_to(JobStatus::Failed),
                !status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn test_cancel_only_from_pending() {
        assert_eq!(
            JobStatus::predecessors(JobStatus::Cancelled),
            vec![JobStatus::Pending]
        );
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&JobStatus::ExtractingData).unwrap();
        assert_eq!(json, "\"EXTRACTING_DATA\"");
    }

    #[test]
    fn test_job_update_omits_unset_fields() {
        let job = FineTuningJob::new_pending("user-1", "base");
        let value = serde_json::to_value(JobUpdate::from(&job)).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["progress"], 0);
        assert!(value.get("jobId").is_some());
        assert!(value.get("adapterPath").is_none());
        assert!(value.get("errorMessage").is_none());
    }
}
