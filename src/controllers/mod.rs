//! Controllers for the Streamline user operator
//!
//! The controller watches StreamlineUser records and hands every event to the
//! [`Reconciler`](crate::reconciler::Reconciler).

mod user;

pub use user::UserController;

use crate::error::OperatorError;
use std::time::Duration;

/// First requeue delay after a transient failure
pub const ERROR_REQUEUE_SECONDS: u64 = 5;

/// Upper bound for the per-record backoff
pub const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

/// Passes a record gets for a permanent credential failure before the
/// controller waits for a change
pub const MAX_CREDENTIAL_FAILURES: u32 = 5;

/// Delay before the next pass after `retries` consecutive failures.
///
/// Transient errors back off exponentially. A permanent credential failure
/// (broken clients CA) is retried at its suggested delay a bounded number of
/// times. Every other permanent error waits for the record to change (`None`).
pub fn error_backoff(error: &OperatorError, retries: u32) -> Option<Duration> {
    if error.is_retryable() {
        // 5s -> 10s -> 20s -> ... -> 300s (capped)
        let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
        let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(10));
        return Some(backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS)));
    }

    match error {
        OperatorError::CredentialGeneration { .. } if retries < MAX_CREDENTIAL_FAILURES => {
            error.requeue_delay()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_back_off_exponentially() {
        let err = OperatorError::broker("connection refused", true);
        assert_eq!(error_backoff(&err, 1), Some(Duration::from_secs(5)));
        assert_eq!(error_backoff(&err, 2), Some(Duration::from_secs(10)));
        assert_eq!(error_backoff(&err, 4), Some(Duration::from_secs(40)));
        assert_eq!(error_backoff(&err, 7), Some(Duration::from_secs(300)));
        assert_eq!(error_backoff(&err, 100), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_permanent_broker_and_secret_errors_wait_for_change() {
        let broker = OperatorError::broker("HTTP 400: malformed ACL", false);
        assert_eq!(error_backoff(&broker, 1), None);

        let secret = OperatorError::secret_sync("forbidden", false);
        assert_eq!(error_backoff(&secret, 1), None);
    }

    #[test]
    fn test_permanent_credential_errors_are_bounded() {
        let err = OperatorError::credential_generation("clients CA missing", false);
        for retries in 1..MAX_CREDENTIAL_FAILURES {
            assert_eq!(error_backoff(&err, retries), Some(Duration::from_secs(300)));
        }
        assert_eq!(error_backoff(&err, MAX_CREDENTIAL_FAILURES), None);
        assert_eq!(error_backoff(&err, MAX_CREDENTIAL_FAILURES + 1), None);
    }

    #[test]
    fn test_validation_errors_wait_for_change() {
        let err = OperatorError::Validation("bad name".to_string());
        assert_eq!(error_backoff(&err, 1), None);
    }
}
