//! Best-effort job status notifications.
//!
//! The job record is authoritative. Webhook delivery is fire-and-forget: no
//! retry, no ordering guarantee, and a failed POST never affects the job.

use std::time::Duration;

use shared_types::JobUpdate;

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

/// Receives every persisted job change. Must return without waiting on I/O.
pub trait StatusReporter: Send + Sync {
    fn notify(&self, update: JobUpdate);
}

/// Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl StatusReporter for NoopReporter {
    fn notify(&self, update: JobUpdate) {
        tracing::trace!(job_id = %update.job_id, "No webhook configured");
    }
}

/// POSTs each update as JSON with a bearer token.
#[derive(Clone)]
pub struct WebhookReporter {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookReporter {
    pub fn new(url: String, token: Option<String>) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, url, token })
    }

    /// Execute a single POST request and check the response status.
    pub async fn deliver(&self, update: &JobUpdate) -> Result<(), WebhookError> {
        let mut request = self.client.post(&self.url).json(update);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

impl StatusReporter for WebhookReporter {
    fn notify(&self, update: JobUpdate) {
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.deliver(&update).await {
                tracing::warn!(
                    job_id = %update.job_id,
                    url = %reporter.url,
                    error = %e,
                    "Webhook delivery failed"
                );
            }
        });
    }
}
