use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::WorkflowConfig;
use crate::error::FailureCause;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Whether a failure on 1-based `attempt` earns another try.
    pub fn should_retry(&self, cause: &FailureCause, attempt: u32) -> bool {
        cause.is_transient() && attempt < self.max_attempts
    }

    /// Delay after the failed 1-based `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails for good, or the token is cancelled
/// during a backoff.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, FailureCause>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, FailureCause>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(cause) if policy.should_retry(&cause, attempt) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(FailureCause::Cancelled {
                            reason: format!("cancelled while waiting to retry {what}"),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(cause) => return Err(cause),
        }
    }
}
