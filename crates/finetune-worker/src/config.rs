use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Worker settings read from the environment.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_token_url: String,
    pub encrypt_secret: String,
    pub encrypt_salt: String,
    pub work_dir: PathBuf,
    pub base_model: String,
    pub train_command: Vec<String>,
    pub deploy_command: Vec<String>,
    pub pipeline: PipelineSettings,
    pub model_prefix: String,
    pub inference_provider: String,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub poll_interval_seconds: u64,
    pub stall_timeout_minutes: i64,
    pub training_stall_timeout_minutes: i64,
}

/// Extraction limits and job liveness polling used by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_emails: u32,
    pub fetch_batch: usize,
    pub min_examples: usize,
    pub max_example_chars: usize,
    /// How often a running job's record is re-read to notice it was failed
    /// or cancelled elsewhere.
    pub liveness_check: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_emails: 500,
            fetch_batch: 50,
            min_examples: 50,
            max_example_chars: 4000,
            liveness_check: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let train_command = split_command(&var_or(
            "FINETUNE_TRAIN_COMMAND",
            "python3 fine-tuning/scripts/finetune-lora.py",
        ));
        if train_command.is_empty() {
            anyhow::bail!("FINETUNE_TRAIN_COMMAND must not be empty");
        }
        let deploy_command = split_command(&var_or("FINETUNE_DEPLOY_COMMAND", "ollama"));
        if deploy_command.is_empty() {
            anyhow::bail!("FINETUNE_DEPLOY_COMMAND must not be empty");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            google_client_id: env::var("GOOGLE_CLIENT_ID")
                .context("GOOGLE_CLIENT_ID must be set")?,
            google_client_secret: env::var("GOOGLE_CLIENT_SECRET")
                .context("GOOGLE_CLIENT_SECRET must be set")?,
            google_token_url: var_or("GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            encrypt_secret: env::var("EMAIL_ENCRYPT_SECRET")
                .context("EMAIL_ENCRYPT_SECRET must be set")?,
            encrypt_salt: env::var("EMAIL_ENCRYPT_SALT")
                .context("EMAIL_ENCRYPT_SALT must be set")?,
            work_dir: PathBuf::from(var_or("FINETUNE_WORK_DIR", "./finetune-jobs")),
            base_model: var_or("FINETUNE_BASE_MODEL", "meta-llama/Llama-3.1-8B-Instruct"),
            train_command,
            deploy_command,
            pipeline: PipelineSettings {
                max_emails: parse_var("FINETUNE_MAX_EMAILS", 500)?,
                fetch_batch: parse_var("FINETUNE_FETCH_BATCH", 50)?,
                min_examples: parse_var("FINETUNE_MIN_EXAMPLES", 50)?,
                max_example_chars: parse_var("FINETUNE_MAX_EXAMPLE_CHARS", 4000)?,
                liveness_check: Duration::from_secs(
                    parse_var("FINETUNE_LIVENESS_CHECK_SECS", 30u64)?.max(1),
                ),
            },
            model_prefix: var_or("FINETUNE_MODEL_PREFIX", "emailai-user"),
            inference_provider: var_or("FINETUNE_INFERENCE_PROVIDER", "ollama"),
            webhook_url: env::var("FINETUNE_WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            webhook_token: env::var("FINETUNE_WEBHOOK_TOKEN").ok().filter(|v| !v.is_empty()),
            poll_interval_seconds: parse_var("FINETUNE_POLL_INTERVAL_SECS", 60)?,
            stall_timeout_minutes: parse_var("FINETUNE_STALL_TIMEOUT_MINS", 30)?,
            training_stall_timeout_minutes: parse_var("FINETUNE_TRAINING_STALL_TIMEOUT_MINS", 720)?,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Program and arguments, split on whitespace.
fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}
