//! The poller: claims one job and drives it through every stage.
//!
//! Stages run strictly in order: extraction, preparation, training,
//! evaluation, deployment. Any error is caught once, in [`Poller::process`],
//! and turned into a FAILED job carrying `"<Kind>: <message>"`. A job that
//! was failed or cancelled elsewhere while running is abandoned as is.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use shared_types::{FineTuningJob, JobStatus, TrainingProfile};
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::credentials::CredentialManager;
use crate::dataset::{self, DatasetFiles};
use crate::deployment::{self, Deployer, Deployment};
use crate::error::{DeploymentError, PipelineError, StoreError};
use crate::extractor;
use crate::gmail_client::{MailSource, SentMessage};
use crate::store::{JobOutputs, JobTransition, UserStore};
use crate::tracker::JobTracker;
use crate::training::{self, Trainer};

// Progress bands per stage.
const EXTRACT_START: i32 = 5;
const EXTRACT_LISTED: i32 = 10;
const EXTRACT_END: i32 = 40;
const PREPARE_START: i32 = 45;
const PREPARE_END: i32 = 50;
const TRAIN_START: i32 = 55;
const EVALUATE_START: i32 = 85;
const DEPLOY_START: i32 = 90;
const COMPLETE: i32 = 100;

const DATA_DIR: &str = "data";

/// Everything the poller talks to.
pub struct Collaborators {
    pub tracker: JobTracker,
    pub users: Arc<dyn UserStore>,
    pub credentials: CredentialManager,
    pub mail: Arc<dyn MailSource>,
    pub trainer: Arc<dyn Trainer>,
    pub deployer: Arc<dyn Deployer>,
}

pub struct Poller {
    tracker: JobTracker,
    users: Arc<dyn UserStore>,
    credentials: CredentialManager,
    mail: Arc<dyn MailSource>,
    trainer: Arc<dyn Trainer>,
    deployer: Arc<dyn Deployer>,
    settings: PipelineSettings,
    profile: TrainingProfile,
    work_dir: PathBuf,
    inference_provider: String,
}

impl Poller {
    pub fn new(
        parts: Collaborators,
        settings: PipelineSettings,
        work_dir: PathBuf,
        inference_provider: String,
    ) -> Self {
        Self {
            tracker: parts.tracker,
            users: parts.users,
            credentials: parts.credentials,
            mail: parts.mail,
            trainer: parts.trainer,
            deployer: parts.deployer,
            settings,
            profile: TrainingProfile::default(),
            work_dir,
            inference_provider,
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Process the oldest pending job, if any.
    ///
    /// Pipeline failures are logged and recorded on the job, then the final
    /// record is returned. Only store failures while selecting or claiming
    /// surface as errors.
    pub async fn run_batch(&self) -> Result<Option<FineTuningJob>, StoreError> {
        let Some(candidate) = self.tracker.store().oldest_pending().await? else {
            tracing::debug!("No pending fine-tuning jobs");
            return Ok(None);
        };

        let Some(job) = self.tracker.claim(candidate.id).await? else {
            tracing::debug!(job_id = %candidate.id, "Job already claimed elsewhere, skipping");
            return Ok(None);
        };

        let job_id = job.id;
        match self.process(job).await {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!(job_id = %job_id, "Fine-tuning job failed: {}", e);
                self.tracker.store().get(job_id).await
            }
        }
    }

    /// Process one named job regardless of age. A claimed job left behind by
    /// a dead worker is re-run from extraction.
    pub async fn run_targeted(&self, job_id: Uuid) -> Result<FineTuningJob, PipelineError> {
        let job = self
            .tracker
            .store()
            .get(job_id)
            .await?
            .ok_or_else(|| PipelineError::Configuration(format!("Job {} not found", job_id)))?;

        let job = match job.status {
            status if status.is_terminal() => {
                return Err(PipelineError::Configuration(format!(
                    "Job {} is already {}",
                    job_id, status
                )));
            }
            JobStatus::Pending => self.tracker.claim(job_id).await?.ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "Job {} could not be claimed; another job for this user is in progress",
                    job_id
                ))
            })?,
            status => {
                tracing::warn!(job_id = %job_id, status = %status, "Recovering claimed job");
                job
            }
        };

        self.process(job).await
    }

    /// The single failure boundary for a claimed job.
    ///
    /// Stages up to deployment race a liveness check: if the record is
    /// failed or cancelled elsewhere (for example by the stall sweep), the
    /// stage future is dropped, which kills any running subprocess.
    pub async fn process(&self, job: FineTuningJob) -> Result<FineTuningJob, PipelineError> {
        let job_id = job.id;
        let user_id = job.user_id.clone();
        tracing::info!(job_id = %job_id, user_id = %user_id, "Processing fine-tuning job");

        let built = tokio::select! {
            built = self.run_stages(&job) => built,
            status = self.stopped_elsewhere(job_id) => Err(PipelineError::Stopped(status)),
        };
        let result = match built {
            Ok(deployed) => self.commit(&job, deployed).await,
            Err(e) => Err(e),
        };
        dataset::discard(&self.job_dir(job_id).join(DATA_DIR)).await;

        match result {
            Ok(job) => {
                tracing::info!(
                    job_id = %job_id,
                    model = job.model_name.as_deref().unwrap_or_default(),
                    "Fine-tuning job completed"
                );
                Ok(job)
            }
            Err(PipelineError::Stopped(status)) => {
                tracing::warn!(job_id = %job_id, status = %status, "Job stopped elsewhere, abandoning work");
                Err(PipelineError::Stopped(status))
            }
            Err(e) => {
                let message = e.job_message();
                tracing::error!(job_id = %job_id, user_id = %user_id, error = %message, "Stage failed");
                if let Err(store_err) = self.tracker.fail(job_id, message).await {
                    tracing::error!(job_id = %job_id, "Failed to record job failure: {}", store_err);
                }
                Err(e)
            }
        }
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.work_dir.join(job_id.to_string())
    }

    /// Resolves once the job is FAILED or CANCELLED (or gone). Read errors
    /// are logged and retried on the next tick.
    async fn stopped_elsewhere(&self, job_id: Uuid) -> JobStatus {
        let mut ticks = tokio::time::interval(self.settings.liveness_check);
        ticks.tick().await;

        loop {
            ticks.tick().await;
            match self.tracker.store().get(job_id).await {
                Ok(Some(job)) if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) => {
                    return job.status;
                }
                Ok(Some(_)) => {}
                Ok(None) => return JobStatus::Cancelled,
                Err(e) => tracing::warn!(job_id = %job_id, "Liveness check failed: {}", e),
            }
        }
    }

    /// Every stage up to and including adapter registration.
    async fn run_stages(&self, job: &FineTuningJob) -> Result<Deployment, PipelineError> {
        if self.users.active_model(&job.user_id).await?.is_none() {
            return Err(PipelineError::Configuration(format!(
                "User {} not found",
                job.user_id
            )));
        }

        let messages = self.extract(job).await?;
        let files = self.prepare(job, &messages).await?;

        self.tracker
            .enter(
                job.id,
                JobTransition::to(JobStatus::Training, TRAIN_START, "Training adapter"),
            )
            .await?;
        let trained = self
            .trainer
            .train(&self.job_dir(job.id), &files, &job.base_model, &self.profile)
            .await;
        dataset::discard(&files.dir).await;
        let checkpoint = trained?;
        tracing::info!(job_id = %job.id, checkpoint = %checkpoint.display(), "Training finished");

        self.tracker
            .enter(
                job.id,
                JobTransition::to(JobStatus::Evaluating, EVALUATE_START, "Verifying checkpoint")
                    .with_outputs(JobOutputs {
                        checkpoint_path: Some(checkpoint.display().to_string()),
                        ..JobOutputs::default()
                    }),
            )
            .await?;
        training::verify_checkpoint(&checkpoint).await?;

        self.tracker
            .enter(
                job.id,
                JobTransition::to(JobStatus::Deploying, DEPLOY_START, "Registering adapter"),
            )
            .await?;
        Ok(self
            .deployer
            .deploy(&checkpoint, &job.user_id, &job.base_model)
            .await?)
    }

    /// Point the user at the new adapter and record COMPLETED. If the
    /// completion write fails the previous active model is put back.
    async fn commit(
        &self,
        job: &FineTuningJob,
        deployed: Deployment,
    ) -> Result<FineTuningJob, PipelineError> {
        let adapter_size = i64::try_from(deployed.adapter_size)
            .map_err(|_| DeploymentError::AdapterTooLarge(deployed.adapter_size))?;
        let previous = self
            .users
            .active_model(&job.user_id)
            .await?
            .ok_or_else(|| PipelineError::Configuration(format!("User {} not found", job.user_id)))?;

        deployment::activate(
            self.users.as_ref(),
            &job.user_id,
            &self.inference_provider,
            &deployed,
            Utc::now(),
        )
        .await?;

        let done = JobTransition::to(JobStatus::Completed, COMPLETE, "Fine-tuning complete")
            .with_outputs(JobOutputs {
                adapter_path: Some(deployed.adapter_path.display().to_string()),
                adapter_size: Some(adapter_size),
                model_name: Some(deployed.alias),
                ..JobOutputs::default()
            });

        match self.tracker.record(job.id, done).await {
            Ok(job) => Ok(job),
            Err(e) => {
                match self.users.set_active_model(&job.user_id, &previous).await {
                    Ok(()) => tracing::warn!(
                        job_id = %job.id,
                        "Completion write failed, restored previous active model"
                    ),
                    Err(restore_err) => tracing::error!(
                        job_id = %job.id,
                        "Completion write failed and previous active model could not be restored: {}",
                        restore_err
                    ),
                }
                Err(e.into())
            }
        }
    }

    async fn extract(&self, job: &FineTuningJob) -> Result<Vec<SentMessage>, PipelineError> {
        let step = |progress, text: String| {
            JobTransition::to(JobStatus::ExtractingData, progress, text)
        };

        self.tracker
            .enter(job.id, step(EXTRACT_START, "Refreshing mail credentials".to_string()))
            .await?;
        let token = self.credentials.access_token(&job.user_id).await?;

        let mailbox = self
            .mail
            .open(&token)
            .await
            .map_err(|e| PipelineError::Extraction(format!("Failed to open mailbox: {:#}", e)))?;
        let ids = mailbox
            .list_sent(self.settings.max_emails)
            .await
            .map_err(|e| PipelineError::Extraction(format!("{:#}", e)))?;

        tracing::info!(job_id = %job.id, count = ids.len(), "Listed sent messages");
        self.tracker
            .enter(job.id, step(EXTRACT_LISTED, format!("Found {} sent messages", ids.len())))
            .await?;

        let batch = self.settings.fetch_batch.max(1);
        let batches = ids.len().div_ceil(batch).max(1);
        let band = (EXTRACT_END - EXTRACT_LISTED) as usize;
        let mut messages = Vec::with_capacity(ids.len());

        for (index, chunk) in ids.chunks(batch).enumerate() {
            messages.extend(extractor::fetch_batch(mailbox.as_ref(), chunk).await);
            tracing::debug!(
                job_id = %job.id,
                batch = index + 1,
                fetched = messages.len(),
                "Fetched message batch"
            );

            let progress = EXTRACT_LISTED + (band * (index + 1) / batches) as i32;
            let text = format!("Fetched {} of {} messages", messages.len(), ids.len());
            self.tracker.enter(job.id, step(progress, text)).await?;
        }

        Ok(messages)
    }

    async fn prepare(
        &self,
        job: &FineTuningJob,
        messages: &[SentMessage],
    ) -> Result<DatasetFiles, PipelineError> {
        self.tracker
            .enter(
                job.id,
                JobTransition::to(
                    JobStatus::PreparingData,
                    PREPARE_START,
                    "Preparing training examples",
                ),
            )
            .await?;

        let examples: Vec<_> = messages
            .iter()
            .filter_map(|m| extractor::to_example(m, self.settings.max_example_chars))
            .collect();

        if examples.len() < self.settings.min_examples {
            return Err(PipelineError::Eligibility {
                found: examples.len(),
                required: self.settings.min_examples,
            });
        }

        let training_emails = i32::try_from(examples.len()).map_err(|_| StoreError::Invariant {
            id: job.id,
            reason: format!("{} training examples cannot be recorded", examples.len()),
        })?;
        let files = dataset::write_dataset(&self.job_dir(job.id).join(DATA_DIR), &examples).await?;

        self.tracker
            .enter(
                job.id,
                JobTransition::to(
                    JobStatus::PreparingData,
                    PREPARE_END,
                    format!("Prepared {} training examples", examples.len()),
                )
                .with_outputs(JobOutputs {
                    training_emails: Some(training_emails),
                    ..JobOutputs::default()
                }),
            )
            .await?;

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::KeyMaterial;
    use crate::store::{ActiveModel, JobStore, MailAccount, MemoryStore};
    use crate::testing::{
        usable_message, FakeDeployer, FakeMail, FakeTrainer, RecordingReporter, RejectCompletion,
        StaticRefresher,
    };
    use crate::watchdog::{self, StallLimits};
    use chrono::Duration;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const USER: &str = "user-1";
    const OTHER_USER: &str = "user-2";
    const TICK: std::time::Duration = std::time::Duration::from_millis(10);

    struct Harness {
        key: Arc<KeyMaterial>,
        store: Arc<MemoryStore>,
        reporter: Arc<RecordingReporter>,
        mail: FakeMail,
        trainer: Arc<FakeTrainer>,
        deployer: Arc<FakeDeployer>,
        poller: Poller,
        work: TempDir,
    }

    struct Setup {
        messages: Vec<SentMessage>,
        failing: Vec<&'static str>,
        trainer: FakeTrainer,
        deployer: FakeDeployer,
        token_expired: bool,
        refresh_rejected: bool,
        reject_completion: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                messages: (0..60).map(usable_message).collect(),
                failing: Vec::new(),
                trainer: FakeTrainer::default(),
                deployer: FakeDeployer::default(),
                token_expired: false,
                refresh_rejected: false,
                reject_completion: false,
            }
        }
    }

    fn previous_model() -> ActiveModel {
        ActiveModel {
            provider: Some("openai".to_string()),
            model: Some("gpt-4o-mini".to_string()),
            adapter_path: None,
            trained_at: None,
        }
    }

    async fn harness(setup: Setup) -> Harness {
        let key = Arc::new(KeyMaterial::derive("pipeline-secret", "pipeline-salt").unwrap());
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let mail = FakeMail::with_messages(setup.messages).failing(&setup.failing);
        let trainer = Arc::new(setup.trainer);
        let deployer = Arc::new(setup.deployer);
        let refresher = Arc::new(StaticRefresher::new(setup.refresh_rejected));
        let work = tempfile::tempdir().unwrap();
        let jobs: Arc<dyn JobStore> = if setup.reject_completion {
            Arc::new(RejectCompletion::new(store.clone()))
        } else {
            store.clone()
        };

        let poller = Poller::new(
            Collaborators {
                tracker: JobTracker::new(jobs, reporter.clone()),
                users: store.clone(),
                credentials: CredentialManager::new(store.clone(), refresher, key.clone()),
                mail: Arc::new(mail.clone()),
                trainer: trainer.clone(),
                deployer: deployer.clone(),
            },
            PipelineSettings {
                fetch_batch: 25,
                liveness_check: TICK,
                ..PipelineSettings::default()
            },
            work.path().to_path_buf(),
            "ollama".to_string(),
        );

        let h = Harness {
            key,
            store,
            reporter,
            mail,
            trainer,
            deployer,
            poller,
            work,
        };
        let expires_at = if setup.token_expired {
            Utc::now() - Duration::minutes(10)
        } else {
            Utc::now() + Duration::hours(1)
        };
        h.add_user(USER, expires_at).await;
        h
    }

    impl Harness {
        async fn add_user(&self, user_id: &str, expires_at: chrono::DateTime<Utc>) {
            self.store.insert_user(user_id, previous_model()).await;
            self.store
                .insert_account(MailAccount {
                    id: Uuid::new_v4(),
                    user_id: user_id.to_string(),
                    refresh_token: Some(self.key.encrypt("refresh-plain").unwrap()),
                    access_token: Some(self.key.encrypt("access-plain").unwrap()),
                    expires_at: Some(expires_at),
                })
                .await;
        }

        async fn submit(&self) -> FineTuningJob {
            self.poller.tracker().create(USER, "base-model").await.unwrap()
        }

        async fn job(&self, id: Uuid) -> FineTuningJob {
            self.store.get(id).await.unwrap().unwrap()
        }

        async fn user_model(&self) -> ActiveModel {
            self.store.active_model(USER).await.unwrap().unwrap()
        }

        /// Every reported change follows the state graph with monotonic progress.
        fn assert_history_valid(&self) {
            let updates = self.reporter.updates();
            for pair in updates.windows(2) {
                let (from, to) = (pair[0].status.unwrap(), pair[1].status.unwrap());
                assert!(
                    from == to && !from.is_terminal() || from.can_transition_to(to),
                    "illegal transition {from} -> {to}"
                );
                assert!(pair[1].progress >= pair[0].progress, "progress went backwards");
            }
        }

        fn last_active_status(&self) -> JobStatus {
            self.reporter
                .statuses()
                .into_iter()
                .filter(|s| *s != JobStatus::Failed)
                .last()
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_scenario_a_completes_and_activates_adapter() {
        let h = harness(Setup::default()).await;
        let submitted = h.submit().await;

        let job = h.poller.run_batch().await.unwrap().unwrap();

        assert_eq!(job.id, submitted.id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.training_emails, Some(60));
        assert!(job.deployed_at.is_some());
        assert!(job.checkpoint_path.is_some());
        assert!(job.adapter_size.unwrap() > 0);
        assert_eq!(job.model_name.as_deref(), Some("emailai-user-user-1"));

        let user = h.user_model().await;
        assert!(user.model.unwrap().contains("user-1"));
        assert_eq!(user.provider.as_deref(), Some("ollama"));
        assert!(user.trained_at.is_some());

        assert_eq!(h.trainer.seen_examples.load(Ordering::SeqCst), 60);
        assert!(!h.work.path().join(job.id.to_string()).join("data").exists());
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_scenario_b_too_few_examples_never_trains() {
        let h = harness(Setup {
            messages: (0..30).map(usable_message).collect(),
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        h.poller.run_batch().await.unwrap();

        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let message = job.error_message.unwrap();
        assert!(message.starts_with("EligibilityError"), "{message}");
        assert!(message.contains("minimum of 50"));
        assert_eq!(h.last_active_status(), JobStatus::PreparingData);
        assert_eq!(h.trainer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.deployer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.user_model().await, previous_model());
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_scenario_c_rejected_refresh_fails_before_listing() {
        let h = harness(Setup {
            token_expired: true,
            refresh_rejected: true,
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        let err = h.poller.run_targeted(submitted.id).await.unwrap_err();

        assert_eq!(err.kind(), "CredentialError");
        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with("CredentialError"));
        assert_eq!(h.last_active_status(), JobStatus::ExtractingData);
        assert_eq!(h.mail.list_calls.load(Ordering::SeqCst), 0);
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_scenario_d_training_failure_skips_deployment() {
        let h = harness(Setup {
            trainer: FakeTrainer::failing("RuntimeError: CUDA out of memory"),
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        let err = h.poller.run_targeted(submitted.id).await.unwrap_err();

        assert_eq!(err.kind(), "TrainingError");
        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .unwrap()
            .contains("RuntimeError: CUDA out of memory"));
        assert!(job.checkpoint_path.is_none());
        assert_eq!(job.progress, TRAIN_START);
        assert_eq!(h.deployer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.user_model().await, previous_model());
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_deployment_failure_leaves_user_untouched() {
        let h = harness(Setup {
            deployer: FakeDeployer {
                fail: true,
                ..FakeDeployer::default()
            },
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        h.poller.run_batch().await.unwrap();

        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with("DeploymentError"));
        assert!(job.adapter_path.is_none());
        assert!(job.model_name.is_none());
        assert!(job.deployed_at.is_none());
        assert_eq!(h.user_model().await, previous_model());
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_failed_fetches_are_skipped() {
        let h = harness(Setup {
            messages: (0..62).map(usable_message).collect(),
            failing: vec!["msg-3", "msg-40"],
            ..Setup::default()
        })
        .await;
        h.submit().await;

        let job = h.poller.run_batch().await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.training_emails, Some(60));
        assert_eq!(h.mail.fetch_calls.load(Ordering::SeqCst), 62);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_before_extraction() {
        let h = harness(Setup {
            token_expired: true,
            ..Setup::default()
        })
        .await;
        h.submit().await;

        let job = h.poller.run_batch().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_batch_without_pending_jobs_is_noop() {
        let h = harness(Setup::default()).await;
        assert!(h.poller.run_batch().await.unwrap().is_none());
        assert!(h.reporter.updates().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_rejects_unknown_and_terminal_jobs() {
        let h = harness(Setup::default()).await;

        let err = h.poller.run_targeted(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");

        let job = h.submit().await;
        h.poller.tracker().cancel(job.id).await.unwrap();
        let err = h.poller.run_targeted(job.id).await.unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert_eq!(h.job(job.id).await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_targeted_recovers_stuck_job() {
        let h = harness(Setup::default()).await;
        let job = h.submit().await;
        let tracker = h.poller.tracker();
        tracker.claim(job.id).await.unwrap().unwrap();
        tracker
            .advance(job.id, JobStatus::PreparingData, 45, "Preparing")
            .await
            .unwrap();
        tracker
            .advance(job.id, JobStatus::Training, 55, "Training adapter")
            .await
            .unwrap();

        let job = h.poller.run_targeted(job.id).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        h.assert_history_valid();
    }

    #[tokio::test]
    async fn test_missing_user_is_configuration_error() {
        let h = harness(Setup::default()).await;
        let job = h.poller.tracker().create("ghost", "base-model").await.unwrap();

        let err = h.poller.run_targeted(job.id).await.unwrap_err();

        assert_eq!(err.kind(), "ConfigurationError");
        assert_eq!(h.job(job.id).await.status, JobStatus::Failed);
    }

    async fn wait_for_status(store: &MemoryStore, job_id: Uuid, status: JobStatus) {
        for _ in 0..500 {
            if store.get(job_id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(TICK).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    async fn wait_for_training(trainer: &FakeTrainer) {
        for _ in 0..500 {
            if trainer.calls.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(TICK).await;
        }
        panic!("training never started");
    }

    #[tokio::test]
    async fn test_batch_skips_user_with_job_in_progress() {
        let h = harness(Setup::default()).await;
        h.add_user(OTHER_USER, Utc::now() + Duration::hours(1)).await;
        let running = h.submit().await;
        let queued = h.submit().await;
        let other = h
            .poller
            .tracker()
            .create(OTHER_USER, "base-model")
            .await
            .unwrap();
        h.poller.tracker().claim(running.id).await.unwrap().unwrap();

        let job = h.poller.run_batch().await.unwrap().unwrap();

        assert_eq!(job.id, other.id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.job(queued.id).await.status, JobStatus::Pending);
        assert!(h.poller.run_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_completion_write_restores_previous_model() {
        let h = harness(Setup {
            reject_completion: true,
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        let err = h.poller.run_targeted(submitted.id).await.unwrap_err();

        assert_eq!(err.kind(), "DatabaseError");
        assert_eq!(h.deployer.calls.load(Ordering::SeqCst), 1);
        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.model_name.is_none());
        assert_eq!(h.user_model().await, previous_model());
    }

    #[tokio::test]
    async fn test_unrecordable_adapter_size_fails_before_activation() {
        let h = harness(Setup {
            deployer: FakeDeployer {
                adapter_size: Some(u64::MAX),
                ..FakeDeployer::default()
            },
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;

        let err = h.poller.run_targeted(submitted.id).await.unwrap_err();

        assert_eq!(err.kind(), "DeploymentError");
        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.adapter_size.is_none());
        assert_eq!(h.user_model().await, previous_model());
    }

    #[tokio::test]
    async fn test_stall_sweep_runs_while_another_job_trains() {
        let gate = Arc::new(Notify::new());
        let h = harness(Setup {
            trainer: FakeTrainer::gated(gate.clone()),
            ..Setup::default()
        })
        .await;

        let mut stalled = FineTuningJob::new_pending("user-stalled", "base-model");
        stalled.status = JobStatus::Training;
        stalled.progress = TRAIN_START;
        stalled.updated_at = Utc::now() - Duration::hours(2);
        h.store.insert_job(stalled.clone()).await;
        let submitted = h.submit().await;

        let limits = StallLimits {
            default_minutes: 30,
            training_minutes: 60,
        };
        let sweeper = watchdog::spawn_sweeper(h.poller.tracker().clone(), limits, TICK);

        let (finished, ()) = tokio::join!(h.poller.run_batch(), async {
            wait_for_training(&h.trainer).await;
            wait_for_status(&h.store, stalled.id, JobStatus::Failed).await;
            assert_eq!(h.job(submitted.id).await.status, JobStatus::Training);
            gate.notify_one();
        });
        sweeper.abort();

        let finished = finished.unwrap().unwrap();
        assert_eq!(finished.id, submitted.id);
        assert_eq!(finished.status, JobStatus::Completed);
        let stalled = h.job(stalled.id).await;
        assert!(stalled.error_message.unwrap().starts_with("Stalled in TRAINING"));
    }

    #[tokio::test]
    async fn test_job_failed_elsewhere_abandons_running_stage() {
        let h = harness(Setup {
            trainer: FakeTrainer::gated(Arc::new(Notify::new())),
            ..Setup::default()
        })
        .await;
        let submitted = h.submit().await;
        let message = "Stalled in TRAINING for more than 720 minutes";

        let (result, ()) = tokio::join!(
            tokio::time::timeout(
                std::time::Duration::from_secs(5),
                h.poller.run_targeted(submitted.id)
            ),
            async {
                wait_for_training(&h.trainer).await;
                h.poller.tracker().fail(submitted.id, message).await.unwrap();
            }
        );

        let err = result.expect("pipeline kept running").unwrap_err();
        assert_eq!(err.kind(), "StoppedError");
        let job = h.job(submitted.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some(message));
        assert_eq!(h.deployer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.user_model().await, previous_model());
        assert!(!h.work.path().join(job.id.to_string()).join("data").exists());
        h.assert_history_valid();
    }
}
