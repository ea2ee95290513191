//! Bounded retry with exponential backoff for external calls.
//!
//! Every call the reconciler makes against the secret store, the CA store or
//! the broker goes through [`RetryPolicy::run`]. Each attempt is bounded by a
//! timeout, only transient failures are retried, and the delay between attempts
//! is an async sleep so other records keep making progress.

use crate::error::{OperatorError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Which reconcile step an external call belongs to.
///
/// Determines the error category reported when an attempt times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CredentialGeneration,
    SecretSync,
    BrokerAdapter,
    ControlPlane,
}

impl Step {
    fn timed_out(self, operation: &str, after: Duration) -> OperatorError {
        let message = format!("{} timed out after {:?}", operation, after);
        match self {
            Step::CredentialGeneration => OperatorError::credential_generation(message, true),
            Step::SecretSync => OperatorError::secret_sync(message, true),
            Step::BrokerAdapter => OperatorError::broker(message, true),
            Step::ControlPlane => OperatorError::ControlPlane(message),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for every further attempt
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Timeout applied to every attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            call_timeout,
            ..Self::default()
        }
    }

    /// Delay after the given (zero-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, step: Step, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(step.timed_out(operation, self.call_timeout)),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        "Transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
