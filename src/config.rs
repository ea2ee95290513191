//! Operator configuration
//!
//! Command line flags with environment fallbacks, converted into the plain
//! configuration structs the library works with.

use crate::broker::HttpBrokerAdminConfig;
use crate::credentials::{CaConfig, CredentialConfig, PasswordPolicy, MIN_PASSWORD_LENGTH};
use crate::error::{OperatorError, Result};
use crate::retry::RetryPolicy;
use clap::Parser;
use std::time::Duration;

/// Streamline User Operator
#[derive(Parser, Debug, Clone)]
#[command(name = "streamline-user-operator")]
#[command(version, about = "Reconciles StreamlineUser credentials, ACLs and quotas")]
pub struct OperatorArgs {
    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "STREAMLINE_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Prefix for secret names when a user does not set one
    #[arg(long, env = "STREAMLINE_SECRET_PREFIX", default_value = "")]
    pub secret_prefix: String,

    /// Namespace holding the clients CA secrets
    #[arg(long, env = "STREAMLINE_CA_NAMESPACE", default_value = "default")]
    pub ca_namespace: String,

    /// Secret holding the clients CA certificate (key ca.crt)
    #[arg(
        long,
        env = "STREAMLINE_CA_CERT_SECRET",
        default_value = "streamline-clients-ca-cert"
    )]
    pub ca_cert_secret: String,

    /// Secret holding the clients CA private key (key ca.key)
    #[arg(long, env = "STREAMLINE_CA_KEY_SECRET", default_value = "streamline-clients-ca")]
    pub ca_key_secret: String,

    /// Validity of issued user certificates in days
    #[arg(long, env = "STREAMLINE_TLS_VALIDITY_DAYS", default_value_t = 365)]
    pub tls_validity_days: u32,

    /// Renew user certificates expiring within this many days
    #[arg(long, env = "STREAMLINE_TLS_RENEWAL_DAYS", default_value_t = 30)]
    pub tls_renewal_days: u32,

    /// Length of generated SCRAM passwords
    #[arg(long, env = "STREAMLINE_PASSWORD_LENGTH", default_value_t = 32)]
    pub password_length: usize,

    /// Keep or regenerate stored SCRAM passwords
    #[arg(long, env = "STREAMLINE_PASSWORD_POLICY", value_enum, default_value_t = PasswordPolicy::Reuse)]
    pub password_policy: PasswordPolicy,

    /// Broker admin API URL; derived from the cluster flags when unset
    #[arg(long, env = "STREAMLINE_BROKER_ADMIN_URL")]
    pub broker_admin_url: Option<String>,

    /// Name of the Streamline cluster the users belong to
    #[arg(long, env = "STREAMLINE_CLUSTER_NAME", default_value = "streamline")]
    pub cluster_name: String,

    /// Namespace of the Streamline cluster
    #[arg(long, env = "STREAMLINE_CLUSTER_NAMESPACE", default_value = "default")]
    pub cluster_namespace: String,

    /// HTTP port of the Streamline brokers
    #[arg(long, env = "STREAMLINE_HTTP_PORT", default_value_t = 9094)]
    pub http_port: u16,

    /// Iteration count for SCRAM credentials
    #[arg(long, env = "STREAMLINE_SCRAM_ITERATIONS", default_value_t = 4096)]
    pub scram_iterations: u32,

    /// Seconds between resyncs of a converged user
    #[arg(long, env = "STREAMLINE_RESYNC_SECONDS", default_value_t = 300)]
    pub resync_seconds: u64,

    /// Timeout of every external call in seconds
    #[arg(long, env = "STREAMLINE_CALL_TIMEOUT_SECONDS", default_value_t = 30)]
    pub call_timeout_seconds: u64,

    /// Attempts per external call, including the first
    #[arg(long, env = "STREAMLINE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,
}

/// Everything a reconcile pass needs to know about the operator's setup
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub secret_prefix: String,
    pub credentials: CredentialConfig,
    pub ca: CaConfig,
    pub retry: RetryPolicy,
    pub scram_iterations: u32,
    pub resync_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            secret_prefix: String::new(),
            credentials: CredentialConfig::default(),
            ca: CaConfig::default(),
            retry: RetryPolicy::default(),
            scram_iterations: 4096,
            resync_interval: Duration::from_secs(300),
        }
    }
}

impl OperatorArgs {
    /// Check flag combinations clap cannot express
    pub fn validate(&self) -> Result<()> {
        if self.password_length < MIN_PASSWORD_LENGTH {
            return Err(OperatorError::Configuration(format!(
                "--password-length must be at least {}",
                MIN_PASSWORD_LENGTH
            )));
        }
        if self.tls_renewal_days >= self.tls_validity_days {
            return Err(OperatorError::Configuration(
                "--tls-renewal-days must be shorter than --tls-validity-days".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(OperatorError::Configuration(
                "--max-attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconciler_config(&self) -> Result<ReconcilerConfig> {
        self.validate()?;
        Ok(ReconcilerConfig {
            secret_prefix: self.secret_prefix.clone(),
            credentials: CredentialConfig {
                tls_validity_days: self.tls_validity_days,
                tls_renewal_days: self.tls_renewal_days,
                password_length: self.password_length,
                password_policy: self.password_policy,
            },
            ca: CaConfig {
                namespace: self.ca_namespace.clone(),
                cert_secret: self.ca_cert_secret.clone(),
                key_secret: self.ca_key_secret.clone(),
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                call_timeout: Duration::from_secs(self.call_timeout_seconds),
                ..RetryPolicy::default()
            },
            scram_iterations: self.scram_iterations,
            resync_interval: Duration::from_secs(self.resync_seconds),
        })
    }

    pub fn broker_admin_config(&self) -> HttpBrokerAdminConfig {
        let mut config = HttpBrokerAdminConfig::for_cluster(
            &self.cluster_name,
            &self.cluster_namespace,
            self.http_port,
        );
        if let Some(url) = &self.broker_admin_url {
            config.base_url = url.clone();
        }
        config.request_timeout = Duration::from_secs(self.call_timeout_seconds);
        config
    }

    /// Namespace to watch, `None` for all namespaces
    pub fn watch_namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }
}
