//! Job-scoped intermediate dataset written for the training routine.

use std::io;
use std::path::{Path, PathBuf};

use shared_types::{DatasetStats, TrainingExample};

use crate::extractor::is_forward;

pub const TRAIN_FILE: &str = "train_alpaca.jsonl";
pub const VAL_FILE: &str = "val_alpaca.jsonl";
pub const STATS_FILE: &str = "dataset_stats.json";

/// Every n-th example goes to validation.
const VAL_EVERY: usize = 10;

const REPLY_PREFIX: &str = "Write a professional email reply about: ";
const NEW_PREFIX: &str = "Write a professional email about: ";

/// Locations of a written dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetFiles {
    pub dir: PathBuf,
    pub train: PathBuf,
    pub val: PathBuf,
    pub stats: DatasetStats,
}

/// Deterministic split: every tenth example (1-based) is held out.
pub fn split(examples: &[TrainingExample]) -> (Vec<&TrainingExample>, Vec<&TrainingExample>) {
    let mut train = Vec::with_capacity(examples.len());
    let mut val = Vec::with_capacity(examples.len() / VAL_EVERY + 1);
    for (idx, example) in examples.iter().enumerate() {
        if (idx + 1) % VAL_EVERY == 0 {
            val.push(example);
        } else {
            train.push(example);
        }
    }
    (train, val)
}

pub fn compute_stats(examples: &[TrainingExample], train: usize, val: usize) -> DatasetStats {
    let lengths: Vec<usize> = examples.iter().map(|e| e.output.chars().count()).collect();
    let total_len: usize = lengths.iter().sum();

    let mut stats = DatasetStats {
        total_examples: examples.len(),
        train_examples: train,
        val_examples: val,
        avg_output_length: if lengths.is_empty() {
            0
        } else {
            total_len / lengths.len()
        },
        min_output_length: lengths.iter().copied().min().unwrap_or(0),
        max_output_length: lengths.iter().copied().max().unwrap_or(0),
        reply_emails: 0,
        forward_emails: 0,
        new_emails: 0,
    };

    for example in examples {
        if example.instruction.starts_with(REPLY_PREFIX) {
            stats.reply_emails += 1;
        } else if example
            .instruction
            .strip_prefix(NEW_PREFIX)
            .is_some_and(is_forward)
        {
            stats.forward_emails += 1;
        } else {
            stats.new_emails += 1;
        }
    }

    stats
}

fn to_jsonl(examples: &[&TrainingExample]) -> io::Result<String> {
    let mut out = String::new();
    for example in examples {
        out.push_str(&serde_json::to_string(example)?);
        out.push('\n');
    }
    Ok(out)
}

/// Write train/val JSONL files and the stats summary into `dir`.
pub async fn write_dataset(dir: &Path, examples: &[TrainingExample]) -> io::Result<DatasetFiles> {
    tokio::fs::create_dir_all(dir).await?;

    let (train, val) = split(examples);
    let stats = compute_stats(examples, train.len(), val.len());

    let train_path = dir.join(TRAIN_FILE);
    let val_path = dir.join(VAL_FILE);
    tokio::fs::write(&train_path, to_jsonl(&train)?).await?;
    tokio::fs::write(&val_path, to_jsonl(&val)?).await?;
    tokio::fs::write(dir.join(STATS_FILE), serde_json::to_vec_pretty(&stats)?).await?;

    tracing::debug!(
        dir = %dir.display(),
        train = stats.train_examples,
        val = stats.val_examples,
        "Dataset written"
    );

    Ok(DatasetFiles {
        dir: dir.to_path_buf(),
        train: train_path,
        val: val_path,
        stats,
    })
}

/// Remove the intermediate examples. Missing directories are fine.
pub async fn discard(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Removed intermediate dataset"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), "Failed to remove dataset: {}", e),
    }
}
