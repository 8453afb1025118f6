//! Long-running subprocess execution with output forwarded to tracing.

use std::collections::VecDeque;
use std::io;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Stderr lines kept for the failure summary.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to wait on process: {0}")]
    Wait(#[source] io::Error),
}

/// How a finished subprocess exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub success: bool,
    pub code: Option<i32>,
    /// Last stderr lines, oldest first.
    pub stderr_tail: String,
}

impl ProcessOutcome {
    /// The captured stderr tail, or a placeholder when the program was silent.
    pub fn summary(&self) -> String {
        if self.stderr_tail.trim().is_empty() {
            "no error output captured".to_string()
        } else {
            self.stderr_tail.clone()
        }
    }
}

/// Run `cmd` to completion. Every stdout/stderr line is logged at debug
/// level under `label`; no timeout is applied.
pub async fn run_streaming(
    cmd: &mut Command,
    label: &'static str,
) -> Result<ProcessOutcome, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_lines(out, label, "stdout", 0)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_lines(err, label, "stderr", STDERR_TAIL_LINES)));

    let status = child.wait().await.map_err(ProcessError::Wait)?;

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(ProcessOutcome {
        success: status.success(),
        code: status.code(),
        stderr_tail,
    })
}

/// Log each line of `stream`, returning the last `keep` lines.
async fn forward_lines<R>(
    stream: R,
    label: &'static str,
    source: &'static str,
    keep: usize,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut tail = VecDeque::with_capacity(keep);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(process = label, stream = source, "{}", line);
                if keep > 0 {
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(process = label, stream = source, "Failed to read output: {}", e);
                break;
            }
        }
    }

    tail.into_iter().collect::<Vec<_>>().join("\n")
}
