use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use evoflow_core::config::RetryConfig;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::*;

/// A model client that retries transport-level failures with exponential
/// backoff. Model-level failures (`success == false`) are returned as-is:
/// they already carry a cost and a reason.
pub struct RetryingClient {
    inner: Box<dyn ModelClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn ModelClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &EvoflowError) -> bool {
    match e {
        EvoflowError::ModelRequest(msg) => {
            let msg = msg.to_lowercase();
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("504")
                || msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.contains("error sending request")
        }
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ModelClient for RetryingClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                match self.inner.attempt(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) => match self.retry_after(&e, attempt) {
                        Some(backoff) => {
                            warn!(
                                attempt = attempt + 1,
                                max_retries = self.retry_config.max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                model = %request.model,
                                error = %e,
                                "Retrying model request"
                            );
                            tokio::time::sleep(backoff).await;
                            attempt += 1;
                        }
                        None => return Err(e),
                    },
                }
            }
        })
    }

    fn attempt(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        self.inner.attempt(request)
    }

    fn retry_after(&self, error: &EvoflowError, attempt: u32) -> Option<Duration> {
        (is_retryable(error) && attempt < self.retry_config.max_retries)
            .then(|| calculate_backoff(attempt, &self.retry_config))
    }
}
