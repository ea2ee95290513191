//! Error types for the Streamline user operator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling a StreamlineUser.
///
/// Every variant maps onto a stable condition reason (see [`OperatorError::reason`])
/// so failures can be reported on the record as data.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The record itself is invalid; only a spec change can fix it
    #[error("{0}")]
    Validation(String),

    /// Issuing a certificate or password failed
    #[error("Credential generation failed: {message}")]
    CredentialGeneration { message: String, transient: bool },

    /// Reading or writing the user secret failed
    #[error("Secret sync failed: {message}")]
    SecretSync { message: String, transient: bool },

    /// A broker admin call failed
    #[error("Broker adapter failed: {message}")]
    BrokerAdapter { message: String, transient: bool },

    /// Reading the record or writing its status failed
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Operator configuration is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl OperatorError {
    pub fn credential_generation(message: impl Into<String>, transient: bool) -> Self {
        OperatorError::CredentialGeneration {
            message: message.into(),
            transient,
        }
    }

    pub fn secret_sync(message: impl Into<String>, transient: bool) -> Self {
        OperatorError::SecretSync {
            message: message.into(),
            transient,
        }
    }

    pub fn broker(message: impl Into<String>, transient: bool) -> Self {
        OperatorError::BrokerAdapter {
            message: message.into(),
            transient,
        }
    }

    /// Condition reason reported on the record
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::Validation(_) => "ValidationFailed",
            OperatorError::CredentialGeneration { .. } => "CredentialGenerationFailed",
            OperatorError::SecretSync { .. } => "SecretSyncFailed",
            OperatorError::BrokerAdapter { .. } => "BrokerAdapterFailed",
            OperatorError::ControlPlane(_) => "ControlPlaneFailed",
            OperatorError::Configuration(_) => "ConfigurationInvalid",
        }
    }

    /// Check if this error is worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::CredentialGeneration { transient, .. }
            | OperatorError::SecretSync { transient, .. }
            | OperatorError::BrokerAdapter { transient, .. } => *transient,
            OperatorError::ControlPlane(_) => true,
            OperatorError::Validation(_) | OperatorError::Configuration(_) => false,
        }
    }

    /// Terminal errors wait for the next spec change instead of a requeue
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperatorError::Validation(_))
    }

    /// Get a suggested requeue delay for errors that are not retried with backoff
    pub fn requeue_delay(&self) -> Option<Duration> {
        if self.is_terminal() {
            None
        } else if self.is_retryable() {
            Some(Duration::from_secs(5))
        } else {
            Some(Duration::from_secs(300))
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::ControlPlane(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::ControlPlane(format!("serialization: {}", err))
    }
}

/// Whether a Kubernetes API failure may succeed on retry.
///
/// Permission, conflict and validation rejections will not.
pub(crate) fn kube_error_is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => !matches!(ae.code, 400 | 401 | 403 | 409 | 422),
        _ => true,
    }
}
