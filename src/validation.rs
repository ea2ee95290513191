//! Validation of StreamlineUser records
//!
//! Turns the loosely typed record into a [`ValidatedUser`] whose authentication
//! mode is a closed enum and whose ACLs and quotas are already expanded into
//! the broker's vocabulary. Every failure is a terminal `ValidationFailed`.

use crate::broker::{acl_principal, AclBinding, QuotaKey, QuotaSet};
use crate::crd::{
    MetadataTemplate, PatternType, ResourceType, SecretKeySelector, StreamlineUser,
    UserAuthentication, UserQuotas,
};
use crate::error::{OperatorError, Result};
use kube::ResourceExt;
use std::collections::BTreeSet;
use std::fmt;

/// Longest record name a user may have
pub const MAX_USER_NAME_LENGTH: usize = 64;

pub const AUTH_TYPE_TLS: &str = "tls";
pub const AUTH_TYPE_TLS_EXTERNAL: &str = "tls-external";
pub const AUTH_TYPE_SCRAM_SHA_512: &str = "scram-sha-512";

/// Resource name used for ACL rules on the cluster resource
pub const CLUSTER_RESOURCE_NAME: &str = "streamline-cluster";

/// How a user authenticates against the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// No authentication section; only ACLs and quotas are managed
    None,
    /// Client certificate issued by the clients CA
    Tls,
    /// Client certificate issued outside the operator
    TlsExternal,
    /// SCRAM-SHA-512, optionally with a password supplied by the user
    ScramSha512 { password: Option<SecretKeySelector> },
}

impl AuthenticationMode {
    pub fn parse(authentication: Option<&UserAuthentication>) -> Result<Self> {
        let Some(auth) = authentication else {
            return Ok(AuthenticationMode::None);
        };

        let mode = match auth.r#type.as_str() {
            AUTH_TYPE_TLS => AuthenticationMode::Tls,
            AUTH_TYPE_TLS_EXTERNAL => AuthenticationMode::TlsExternal,
            AUTH_TYPE_SCRAM_SHA_512 => {
                return Ok(AuthenticationMode::ScramSha512 {
                    password: auth
                        .password
                        .as_ref()
                        .map(|p| p.value_from.secret_key_ref.clone()),
                });
            }
            other => {
                return Err(OperatorError::Validation(format!(
                    "Unsupported authentication type '{}'; expected one of {}, {}, {}",
                    other, AUTH_TYPE_TLS, AUTH_TYPE_TLS_EXTERNAL, AUTH_TYPE_SCRAM_SHA_512
                )))
            }
        };

        if auth.password.is_some() {
            return Err(OperatorError::Validation(format!(
                "A password can only be provided for {} authentication",
                AUTH_TYPE_SCRAM_SHA_512
            )));
        }
        Ok(mode)
    }

    /// Broker identity of a user with this mode
    pub fn username(&self, name: &str) -> String {
        match self {
            AuthenticationMode::Tls | AuthenticationMode::TlsExternal => format!("CN={}", name),
            AuthenticationMode::ScramSha512 { .. } | AuthenticationMode::None => name.to_string(),
        }
    }

    /// Whether the operator owns a credentials secret in this mode
    pub fn has_secret(&self) -> bool {
        matches!(
            self,
            AuthenticationMode::Tls | AuthenticationMode::ScramSha512 { .. }
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationMode::None => "none",
            AuthenticationMode::Tls => AUTH_TYPE_TLS,
            AuthenticationMode::TlsExternal => AUTH_TYPE_TLS_EXTERNAL,
            AuthenticationMode::ScramSha512 { .. } => AUTH_TYPE_SCRAM_SHA_512,
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that passed validation, with everything the reconciler derives from it
#[derive(Debug, Clone)]
pub struct ValidatedUser {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub generation: i64,
    pub mode: AuthenticationMode,
    /// Broker identity (`CN=<name>` for the TLS modes)
    pub username: String,
    /// Name of the credentials secret
    pub secret_name: String,
    pub secret_template: MetadataTemplate,
    pub acls: BTreeSet<AclBinding>,
    pub quotas: QuotaSet,
}

/// Validate `user`; `default_prefix` applies when the record sets no secret prefix.
pub fn validate(user: &StreamlineUser, default_prefix: &str) -> Result<ValidatedUser> {
    let name = user.name_any();
    check_name(&name)?;

    let mode = AuthenticationMode::parse(user.spec.authentication.as_ref())?;
    let username = mode.username(&name);
    let acls = expand_acls(user, &username)?;
    let quotas = match &user.spec.quotas {
        Some(quotas) => expand_quotas(quotas)?,
        None => QuotaSet::new(),
    };

    let prefix = user
        .spec
        .secret_name_prefix
        .as_deref()
        .unwrap_or(default_prefix);
    let secret_template = user
        .spec
        .template
        .as_ref()
        .and_then(|t| t.secret.as_ref())
        .map(|s| s.metadata.clone())
        .unwrap_or_default();

    Ok(ValidatedUser {
        namespace: user.namespace().unwrap_or_else(|| "default".to_string()),
        secret_name: format!("{}{}", prefix, name),
        name,
        uid: user.metadata.uid.clone(),
        generation: user.metadata.generation.unwrap_or_default(),
        mode,
        username,
        secret_template,
        acls,
        quotas,
    })
}

fn check_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if length > MAX_USER_NAME_LENGTH {
        return Err(OperatorError::Validation(format!(
            "User name {} is {} characters long, but users can have a name only up to {} characters long",
            name, length, MAX_USER_NAME_LENGTH
        )));
    }
    Ok(())
}

/// One binding per (rule, operation); duplicates collapse.
fn expand_acls(user: &StreamlineUser, username: &str) -> Result<BTreeSet<AclBinding>> {
    let Some(authorization) = &user.spec.authorization else {
        return Ok(BTreeSet::new());
    };

    let principal = acl_principal(username);
    let mut bindings = BTreeSet::new();
    for (index, rule) in authorization.acls.iter().enumerate() {
        if rule.operations.is_empty() {
            return Err(OperatorError::Validation(format!(
                "ACL rule {} has no operations",
                index
            )));
        }
        if rule.host.is_empty() {
            return Err(OperatorError::Validation(format!(
                "ACL rule {} has an empty host",
                index
            )));
        }

        let (resource_name, pattern_type) = match rule.resource_type {
            ResourceType::Cluster => (CLUSTER_RESOURCE_NAME.to_string(), PatternType::Literal),
            _ if rule.resource_name.is_empty() => {
                return Err(OperatorError::Validation(format!(
                    "ACL rule {} on {:?} requires a resource name",
                    index, rule.resource_type
                )));
            }
            _ => (rule.resource_name.clone(), rule.pattern_type),
        };

        for operation in &rule.operations {
            bindings.insert(AclBinding {
                principal: principal.clone(),
                resource_type: rule.resource_type,
                pattern_type,
                resource_name: resource_name.clone(),
                operation: *operation,
                permission: rule.permission,
                host: rule.host.clone(),
            });
        }
    }
    Ok(bindings)
}

fn expand_quotas(quotas: &UserQuotas) -> Result<QuotaSet> {
    let mut set = QuotaSet::new();

    for (key, value) in [
        (QuotaKey::ProducerByteRate, quotas.producer_byte_rate),
        (QuotaKey::ConsumerByteRate, quotas.consumer_byte_rate),
    ] {
        if let Some(value) = value {
            if value < 0 {
                return Err(OperatorError::Validation(format!(
                    "Quota {} must not be negative",
                    key.as_str()
                )));
            }
            set.insert(key, value as f64);
        }
    }

    if let Some(percentage) = quotas.request_percentage {
        if !(0..=100).contains(&percentage) {
            return Err(OperatorError::Validation(format!(
                "Quota {} must be between 0 and 100",
                QuotaKey::RequestPercentage.as_str()
            )));
        }
        set.insert(QuotaKey::RequestPercentage, f64::from(percentage));
    }

    if let Some(rate) = quotas.controller_mutation_rate {
        if !rate.is_finite() || rate < 0.0 {
            return Err(OperatorError::Validation(format!(
                "Quota {} must be a non-negative number",
                QuotaKey::ControllerMutationRate.as_str()
            )));
        }
        set.insert(QuotaKey::ControllerMutationRate, rate);
    }

    Ok(set)
}
