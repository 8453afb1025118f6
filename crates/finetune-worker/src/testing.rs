//! In-process fakes for the pipeline's external collaborators.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared_types::{FineTuningJob, JobStatus, JobUpdate, TrainingProfile};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::credentials::{RefreshedToken, TokenRefresher};
use crate::dataset::DatasetFiles;
use crate::deployment::{directory_size, model_alias, Deployer, Deployment};
use crate::error::{CredentialError, DeploymentError, StoreError, TrainingError};
use crate::gmail_client::{MailSource, Mailbox, SentMessage};
use crate::reporter::StatusReporter;
use crate::store::{JobStore, JobTransition};
use crate::training::{Trainer, CHECKPOINT_DIR};

#[derive(Default)]
pub struct RecordingReporter {
    updates: Mutex<Vec<JobUpdate>>,
}

impl RecordingReporter {
    pub fn updates(&self) -> Vec<JobUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.updates().iter().filter_map(|u| u.status).collect()
    }
}

impl StatusReporter for RecordingReporter {
    fn notify(&self, update: JobUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

pub struct StaticRefresher {
    pub reject: bool,
    pub calls: AtomicUsize,
}

impl StaticRefresher {
    pub fn new(reject: bool) -> Self {
        Self {
            reject,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(CredentialError::RefreshRejected {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.to_string(),
            });
        }
        Ok(RefreshedToken {
            access_token: "fresh-access".to_string(),
            expires_in: Some(3600),
        })
    }
}

/// A sent message whose body survives cleaning.
pub fn usable_message(index: usize) -> SentMessage {
    SentMessage {
        id: format!("msg-{}", index),
        thread_id: format!("thread-{}", index),
        subject: if index % 3 == 0 {
            format!("Re: Project update {}", index)
        } else {
            format!("Project update {}", index)
        },
        to: vec!["team@example.com".to_string()],
        body_text: Some(format!(
            "Hi team,\n\nHere is the status for milestone {}. Everything is on track for the launch.\n\nBest regards,\nSam",
            index
        )),
        body_html: None,
        sent_at: None,
    }
}

#[derive(Clone, Default)]
pub struct FakeMail {
    messages: Arc<Vec<SentMessage>>,
    failing: Arc<HashSet<String>>,
    pub list_calls: Arc<AtomicUsize>,
    pub fetch_calls: Arc<AtomicUsize>,
}

impl FakeMail {
    pub fn with_messages(messages: Vec<SentMessage>) -> Self {
        Self {
            messages: Arc::new(messages),
            ..Self::default()
        }
    }

    pub fn failing(mut self, ids: &[&str]) -> Self {
        self.failing = Arc::new(ids.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[async_trait]
impl Mailbox for FakeMail {
    async fn list_sent(&self, max: u32) -> Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .messages
            .iter()
            .take(max as usize)
            .map(|m| m.id.clone())
            .collect())
    }

    async fn get_message(&self, message_id: &str) -> Result<SentMessage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(message_id) {
            return Err(anyhow!("429 rate limit exceeded"));
        }
        self.messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| anyhow!("message {} not found", message_id))
    }
}

#[async_trait]
impl MailSource for FakeMail {
    async fn open(&self, access_token: &str) -> Result<Box<dyn Mailbox>> {
        if access_token.is_empty() {
            return Err(anyhow!("empty access token"));
        }
        Ok(Box::new(self.clone()))
    }
}

/// Writes a minimal adapter, or exits non-zero when `failure` is set. With
/// a gate, training blocks until the gate is notified.
#[derive(Default)]
pub struct FakeTrainer {
    pub failure: Option<String>,
    pub gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
    pub seen_examples: AtomicUsize,
}

impl FakeTrainer {
    pub fn failing(summary: &str) -> Self {
        Self {
            failure: Some(summary.to_string()),
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(
        &self,
        job_dir: &Path,
        dataset: &DatasetFiles,
        _base_model: &str,
        _profile: &TrainingProfile,
    ) -> Result<PathBuf, TrainingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lines = tokio::fs::read_to_string(&dataset.train).await?.lines().count()
            + tokio::fs::read_to_string(&dataset.val).await?.lines().count();
        self.seen_examples.store(lines, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if let Some(summary) = &self.failure {
            return Err(TrainingError::Exit {
                code: Some(1),
                summary: summary.clone(),
            });
        }

        let checkpoint = job_dir.join(CHECKPOINT_DIR);
        tokio::fs::create_dir_all(&checkpoint).await?;
        tokio::fs::write(checkpoint.join("adapter_config.json"), b"{\"r\":16}").await?;
        tokio::fs::write(checkpoint.join("adapter_model.safetensors"), vec![0u8; 64]).await?;
        Ok(checkpoint)
    }
}

#[derive(Default)]
pub struct FakeDeployer {
    pub fail: bool,
    /// Reported adapter size instead of the checkpoint's real size.
    pub adapter_size: Option<u64>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn deploy(
        &self,
        checkpoint: &Path,
        user_id: &str,
        _base_model: &str,
    ) -> Result<Deployment, DeploymentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeploymentError::Exit {
                code: Some(1),
                summary: "Error: model server unreachable".to_string(),
            });
        }
        Ok(Deployment {
            alias: model_alias("emailai-user", user_id),
            adapter_path: checkpoint.to_path_buf(),
            adapter_size: match self.adapter_size {
                Some(size) => size,
                None => directory_size(checkpoint).await?,
            },
        })
    }
}

/// Job store that refuses every COMPLETED write and passes the rest through.
pub struct RejectCompletion {
    inner: Arc<dyn JobStore>,
}

impl RejectCompletion {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl JobStore for RejectCompletion {
    async fn create(&self, user_id: &str, base_model: &str) -> Result<FineTuningJob, StoreError> {
        self.inner.create(user_id, base_model).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn oldest_pending(&self) -> Result<Option<FineTuningJob>, StoreError> {
        self.inner.oldest_pending().await
    }

    async fn list_in_progress(&self) -> Result<Vec<FineTuningJob>, StoreError> {
        self.inner.list_in_progress().await
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<FineTuningJob>, StoreError> {
        self.inner.claim(job_id).await
    }

    async fn transition(
        &self,
        job_id: Uuid,
        change: JobTransition,
    ) -> Result<FineTuningJob, StoreError> {
        if change.status == JobStatus::Completed {
            return Err(StoreError::Conflict(job_id));
        }
        self.inner.transition(job_id, change).await
    }
}
