//! Training invoker: runs the external LoRA training routine.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use shared_types::TrainingProfile;
use tokio::process::Command;

use crate::dataset::DatasetFiles;
use crate::error::TrainingError;
use crate::process::{run_streaming, ProcessError};

pub const CONFIG_FILE: &str = "lora-config.yaml";
pub const CHECKPOINT_DIR: &str = "checkpoint";

const ADAPTER_CONFIG: &str = "adapter_config.json";
const ADAPTER_WEIGHTS: [&str; 2] = ["adapter_model.safetensors", "adapter_model.bin"];

/// Produces a checkpoint directory from a prepared dataset.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(
        &self,
        job_dir: &Path,
        dataset: &DatasetFiles,
        base_model: &str,
        profile: &TrainingProfile,
    ) -> Result<PathBuf, TrainingError>;
}

/// Runs a local training program: `<command> --config <file> --output <dir>`.
#[derive(Debug, Clone)]
pub struct LocalTrainer {
    command: Vec<String>,
}

#[derive(Serialize)]
struct TrainingConfig<'a> {
    base_model: &'a str,
    train_data: &'a Path,
    val_data: &'a Path,
    output_dir: &'a Path,
    #[serde(flatten)]
    profile: &'a TrainingProfile,
}

impl LocalTrainer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// JSON is a subset of YAML, so the training script reads this as-is.
    async fn write_config(
        &self,
        path: &Path,
        dataset: &DatasetFiles,
        base_model: &str,
        output_dir: &Path,
        profile: &TrainingProfile,
    ) -> Result<(), TrainingError> {
        let config = TrainingConfig {
            base_model,
            train_data: &dataset.train,
            val_data: &dataset.val,
            output_dir,
            profile,
        };
        let body = serde_json::to_vec_pretty(&config).map_err(io::Error::from)?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl Trainer for LocalTrainer {
    async fn train(
        &self,
        job_dir: &Path,
        dataset: &DatasetFiles,
        base_model: &str,
        profile: &TrainingProfile,
    ) -> Result<PathBuf, TrainingError> {
        let (program, args) = self.command.split_first().ok_or_else(|| TrainingError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty training command"),
        })?;

        let config_path = job_dir.join(CONFIG_FILE);
        let checkpoint = job_dir.join(CHECKPOINT_DIR);
        self.write_config(&config_path, dataset, base_model, &checkpoint, profile)
            .await?;

        tracing::info!(
            program = %program,
            config = %config_path.display(),
            "Starting training subprocess"
        );

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--config")
            .arg(&config_path)
            .arg("--output")
            .arg(&checkpoint);

        let outcome = run_streaming(&mut cmd, "training")
            .await
            .map_err(|e| match e {
                ProcessError::Spawn(source) => TrainingError::Spawn {
                    program: program.clone(),
                    source,
                },
                ProcessError::Wait(source) => TrainingError::Io(source),
            })?;

        if !outcome.success {
            return Err(TrainingError::Exit {
                code: outcome.code,
                summary: outcome.summary(),
            });
        }

        Ok(checkpoint)
    }
}

/// Check that `checkpoint` holds a loadable adapter.
pub async fn verify_checkpoint(checkpoint: &Path) -> Result<(), TrainingError> {
    let missing = |what: &str| TrainingError::MissingArtifact {
        path: checkpoint.to_path_buf(),
        missing: what.to_string(),
    };

    if !tokio::fs::try_exists(checkpoint).await? {
        return Err(missing("the checkpoint directory"));
    }
    if !tokio::fs::try_exists(checkpoint.join(ADAPTER_CONFIG)).await? {
        return Err(missing(ADAPTER_CONFIG));
    }
    for weights in ADAPTER_WEIGHTS {
        if tokio::fs::try_exists(checkpoint.join(weights)).await? {
            return Ok(());
        }
    }
    Err(missing("adapter weights"))
}
