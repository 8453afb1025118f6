//! Deployment invoker: registers the trained adapter and points the user at it.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::error::DeploymentError;
use crate::process::{run_streaming, ProcessError};
use crate::store::{ActiveModel, UserStore};

pub const MODELFILE: &str = "Modelfile";

/// A registered adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub alias: String,
    pub adapter_path: PathBuf,
    pub adapter_size: u64,
}

/// Registers a checkpoint as a per-user adapter under a stable alias.
/// Re-running for the same user replaces the previous registration.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        checkpoint: &Path,
        user_id: &str,
        base_model: &str,
    ) -> Result<Deployment, DeploymentError>;
}

/// `<prefix>-<user id>`, lowercased with anything non-alphanumeric mapped to `-`.
pub fn model_alias(prefix: &str, user_id: &str) -> String {
    let token: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", prefix, token)
}

/// Total size in bytes of every file under `root`.
pub async fn directory_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }

    Ok(total)
}

/// Registers adapters with a local model server: writes a Modelfile next to
/// the checkpoint and runs `<command> create <alias> -f <Modelfile>`.
#[derive(Debug, Clone)]
pub struct LocalDeployer {
    command: Vec<String>,
    prefix: String,
}

impl LocalDeployer {
    pub fn new(command: Vec<String>, prefix: impl Into<String>) -> Self {
        Self {
            command,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Deployer for LocalDeployer {
    async fn deploy(
        &self,
        checkpoint: &Path,
        user_id: &str,
        base_model: &str,
    ) -> Result<Deployment, DeploymentError> {
        let (program, args) = self.command.split_first().ok_or_else(|| DeploymentError::Spawn {
            program: String::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty deployment command"),
        })?;

        let alias = model_alias(&self.prefix, user_id);
        let modelfile = checkpoint.join(MODELFILE);
        tokio::fs::write(
            &modelfile,
            format!("FROM {}\nADAPTER {}\n", base_model, checkpoint.display()),
        )
        .await?;

        tracing::info!(alias = %alias, checkpoint = %checkpoint.display(), "Registering adapter");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("create")
            .arg(&alias)
            .arg("-f")
            .arg(&modelfile);

        let outcome = run_streaming(&mut cmd, "deployment")
            .await
            .map_err(|e| match e {
                ProcessError::Spawn(source) => DeploymentError::Spawn {
                    program: program.clone(),
                    source,
                },
                ProcessError::Wait(source) => DeploymentError::Io(source),
            })?;

        if !outcome.success {
            return Err(DeploymentError::Exit {
                code: outcome.code,
                summary: outcome.summary(),
            });
        }

        let adapter_size = directory_size(checkpoint).await?;

        Ok(Deployment {
            alias,
            adapter_path: checkpoint.to_path_buf(),
            adapter_size,
        })
    }
}

/// Flip the user's active-model pointer to a deployed adapter. Only called
/// after registration succeeded.
pub async fn activate(
    users: &dyn UserStore,
    user_id: &str,
    provider: &str,
    deployment: &Deployment,
    trained_at: DateTime<Utc>,
) -> Result<(), DeploymentError> {
    let model = ActiveModel {
        provider: Some(provider.to_string()),
        model: Some(deployment.alias.clone()),
        adapter_path: Some(deployment.adapter_path.display().to_string()),
        trained_at: Some(trained_at),
    };

    users
        .set_active_model(user_id, &model)
        .await
        .map_err(DeploymentError::UserUpdate)
}
