use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use finetune_worker::config::WorkerConfig;
use finetune_worker::credentials::{CredentialManager, GoogleTokenRefresher, KeyMaterial};
use finetune_worker::db::{self, PgStore};
use finetune_worker::deployment::LocalDeployer;
use finetune_worker::gmail_client::GmailSource;
use finetune_worker::pipeline::{Collaborators, Poller};
use finetune_worker::reporter::{NoopReporter, StatusReporter, WebhookReporter};
use finetune_worker::tracker::JobTracker;
use finetune_worker::training::LocalTrainer;
use finetune_worker::watchdog::{self, StallLimits};

#[derive(Parser)]
#[command(name = "finetune-worker")]
#[command(about = "Runs per-user model fine-tuning jobs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the oldest pending job, if there is one (default)
    Run,

    /// Process one job by id, including a claimed job left behind by a
    /// crashed worker. Exits non-zero if the job fails.
    Job { job_id: Uuid },

    /// Poll for pending jobs on an interval and fail stalled ones
    Watch,

    /// Cancel a job that has not been claimed yet
    Cancel { job_id: Uuid },

    /// Queue a new fine-tuning job for a user
    Submit {
        user_id: String,

        /// Base model to fine-tune; defaults to FINETUNE_BASE_MODEL
        #[arg(long)]
        base_model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finetune_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    let pool = db::establish_connection_pool(&config.database_url)
        .context("Failed to create database pool")?;
    let store = Arc::new(PgStore::new(pool));

    let reporter: Arc<dyn StatusReporter> = match &config.webhook_url {
        Some(url) => Arc::new(
            WebhookReporter::new(url.clone(), config.webhook_token.clone())
                .context("Failed to build webhook client")?,
        ),
        None => Arc::new(NoopReporter),
    };
    let tracker = JobTracker::new(store.clone(), reporter);

    let command = cli.command.unwrap_or(Commands::Run);
    match &command {
        Commands::Cancel { job_id } => {
            let job = tracker.cancel(*job_id).await?;
            tracing::info!(job_id = %job.id, status = %job.status, "Cancel request handled");
            return Ok(());
        }
        Commands::Submit {
            user_id,
            base_model,
        } => {
            let base_model = base_model.as_deref().unwrap_or(&config.base_model);
            let job = tracker.create(user_id, base_model).await?;
            println!("{}", job.id);
            return Ok(());
        }
        _ => {}
    }

    let key = Arc::new(
        KeyMaterial::derive(&config.encrypt_secret, &config.encrypt_salt)
            .context("Failed to derive token encryption key")?,
    );
    let refresher = Arc::new(GoogleTokenRefresher::new(
        config.google_token_url.clone(),
        config.google_client_id.clone(),
        config.google_client_secret.clone(),
    ));

    let poller = Poller::new(
        Collaborators {
            tracker: tracker.clone(),
            users: store.clone(),
            credentials: CredentialManager::new(store.clone(), refresher, key),
            mail: Arc::new(GmailSource),
            trainer: Arc::new(LocalTrainer::new(config.train_command.clone())),
            deployer: Arc::new(LocalDeployer::new(
                config.deploy_command.clone(),
                config.model_prefix.clone(),
            )),
        },
        config.pipeline.clone(),
        config.work_dir.clone(),
        config.inference_provider.clone(),
    );

    match command {
        Commands::Job { job_id } => {
            let job = poller
                .run_targeted(job_id)
                .await
                .with_context(|| format!("Fine-tuning job {} failed", job_id))?;
            tracing::info!(job_id = %job.id, model = ?job.model_name, "Job completed");
        }
        Commands::Watch => watch(&poller, &config).await?,
        _ => {
            if let Some(job) = poller.run_batch().await? {
                tracing::info!(job_id = %job.id, status = %job.status, "Batch run finished");
            }
        }
    }

    Ok(())
}

async fn watch(poller: &Poller, config: &WorkerConfig) -> Result<()> {
    let limits = StallLimits {
        default_minutes: config.stall_timeout_minutes,
        training_minutes: config.training_stall_timeout_minutes,
    };
    let period = Duration::from_secs(config.poll_interval_seconds.max(1));
    let mut interval = tokio::time::interval(period);

    // Runs beside the poller so a job stuck in a long stage is still swept.
    let sweeper = watchdog::spawn_sweeper(poller.tracker().clone(), limits, period);

    tracing::info!(
        interval_seconds = config.poll_interval_seconds,
        "Fine-tuning worker watching for jobs. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Shutdown signal received, stopping...");
                sweeper.abort();
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        // Drain the queue before waiting for the next tick.
        loop {
            match poller.run_batch().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Polling cycle failed: {}", e);
                    break;
                }
            }
        }
    }
}
