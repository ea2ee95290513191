//! User reconciler
//!
//! One pass validates a record, converges its credentials secret and broker
//! state, and commits the outcome as the record's status:
//!
//! ```text
//! validate -> credentials + secret -> clear old principal -> broker apply -> status
//! ```
//!
//! Passes for the same record are serialized through the [`ReconcileRegistry`],
//! and a pass that finds a newer generation at commit time drops its status.

use crate::broker::{ApplyReport, BrokerAdapter, BrokerAdmin, ScramSync};
use crate::config::ReconcilerConfig;
use crate::credentials::{load_clients_ca, Credential, CredentialGenerator};
use crate::crd::{StreamlineUser, UserStatus};
use crate::error::{OperatorError, Result};
use crate::registry::{record_key, ReconcileRegistry};
use crate::retry::Step;
use crate::secrets::{desired_secret, SecretOutcome, SecretStore, SecretSynchronizer};
use crate::status::{not_ready_status, ready_status, status_unchanged};
use crate::store::UserStore;
use crate::validation::{validate, AuthenticationMode, ValidatedUser};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What happened to the status at the end of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Written,
    /// The stored status already said the same thing
    Unchanged,
    /// A newer generation was observed; nothing was written
    Superseded,
    /// The record no longer exists
    Gone,
}

/// Summary of a successful pass
#[derive(Debug, Clone)]
pub struct PassReport {
    pub username: String,
    pub secret_name: Option<String>,
    /// `None` when the mode has no secret
    pub secret: Option<SecretOutcome>,
    pub credential_reused: bool,
    pub broker: ApplyReport,
    pub status: CommitOutcome,
}

struct Converged {
    username: String,
    secret_name: Option<String>,
    secret: Option<SecretOutcome>,
    credential_reused: bool,
    broker: ApplyReport,
}

/// Credential state after the secret step
#[derive(Default)]
struct CredentialState {
    secret: Option<SecretOutcome>,
    reused: bool,
    scram_password: Option<String>,
}

/// Drives StreamlineUser records to their desired state.
pub struct Reconciler {
    users: Arc<dyn UserStore>,
    secrets: SecretSynchronizer,
    broker: BrokerAdapter,
    generator: CredentialGenerator,
    registry: ReconcileRegistry,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        users: Arc<dyn UserStore>,
        secrets: Arc<dyn SecretStore>,
        broker: Arc<dyn BrokerAdmin>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            users,
            secrets: SecretSynchronizer::new(secrets, config.retry.clone()),
            broker: BrokerAdapter::new(broker, config.retry.clone())
                .with_scram_iterations(config.scram_iterations),
            generator: CredentialGenerator::new(config.credentials.clone()),
            registry: ReconcileRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ReconcileRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &BrokerAdapter {
        &self.broker
    }

    /// Run one reconcile pass for `user`.
    ///
    /// The status is written before an error is returned, so the record shows
    /// `NotReady` with the failing step's reason either way.
    #[instrument(skip(self, user), fields(name = %user.name_any(), namespace = user.namespace()))]
    pub async fn reconcile(&self, user: &StreamlineUser) -> Result<PassReport> {
        let namespace = user.namespace().unwrap_or_else(|| "default".to_string());
        let name = user.name_any();
        let key = record_key(&namespace, &name);
        let generation = user.metadata.generation.unwrap_or_default();

        self.registry.observe(&key, generation);
        let _guard = self.registry.acquire(&key).await;

        if self.registry.is_superseded(&key, generation) {
            debug!(generation, "Newer generation queued, skipping pass");
            return Ok(PassReport {
                username: String::new(),
                secret_name: None,
                secret: None,
                credential_reused: false,
                broker: ApplyReport::default(),
                status: CommitOutcome::Superseded,
            });
        }

        let previous = user.status.as_ref();
        let result = self.converge(user).await;
        let status = match &result {
            Ok(converged) => ready_status(
                previous,
                generation,
                converged.username.clone(),
                converged.secret_name.clone(),
            ),
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "Reconcile pass failed");
                not_ready_status(previous, generation, e)
            }
        };

        let commit = self
            .commit_status(&key, &namespace, &name, generation, &status)
            .await;

        let converged = result?;
        let commit = commit?;
        info!(
            username = %converged.username,
            status = ?commit,
            "User reconciled"
        );
        Ok(PassReport {
            username: converged.username,
            secret_name: converged.secret_name,
            secret: converged.secret,
            credential_reused: converged.credential_reused,
            broker: converged.broker,
            status: commit,
        })
    }

    async fn converge(&self, user: &StreamlineUser) -> Result<Converged> {
        let validated = validate(user, &self.config.secret_prefix)?;
        debug!(mode = %validated.mode, username = %validated.username, "Validated user");

        let credentials = self.sync_credentials(&validated).await?;

        let previous_username = user.status.as_ref().and_then(|s| s.username.as_deref());
        let mut broker = ApplyReport::default();
        if let Some(old) = previous_username.filter(|old| *old != validated.username) {
            info!(old, new = %validated.username, "Username changed, clearing old principal");
            broker.merge(self.broker.clear(old).await?);
        }

        let scram = match &credentials.scram_password {
            Some(password) => ScramSync::Present {
                password,
                rotated: credentials.secret.is_some_and(SecretOutcome::written),
            },
            None => ScramSync::Absent,
        };
        broker.merge(
            self.broker
                .apply(&validated.username, &validated.acls, &validated.quotas, scram)
                .await?,
        );

        Ok(Converged {
            secret_name: validated
                .mode
                .has_secret()
                .then(|| validated.secret_name.clone()),
            username: validated.username,
            secret: credentials.secret,
            credential_reused: credentials.reused,
            broker,
        })
    }

    async fn sync_credentials(&self, user: &ValidatedUser) -> Result<CredentialState> {
        let namespace = user.namespace.as_str();
        let uid = user
            .uid
            .as_deref()
            .ok_or_else(|| OperatorError::ControlPlane(format!("User {} has no uid", user.name)))?;

        let provided_password = match &user.mode {
            AuthenticationMode::Tls => None,
            AuthenticationMode::ScramSha512 { password } => match password {
                Some(selector) => Some(self.secrets.read_password(namespace, selector).await?),
                None => None,
            },
            AuthenticationMode::TlsExternal | AuthenticationMode::None => {
                self.secrets
                    .remove_owned(namespace, &user.secret_name, uid)
                    .await?;
                return Ok(CredentialState::default());
            }
        };

        let ca = match user.mode {
            AuthenticationMode::Tls => Some(
                load_clients_ca(self.secrets.store(), &self.config.ca, &self.config.retry).await?,
            ),
            _ => None,
        };
        let existing = self
            .secrets
            .read_credential(namespace, &user.secret_name)
            .await?;

        let resolved = self
            .generator
            .resolve(
                &user.name,
                &user.mode,
                ca.as_ref(),
                existing.as_ref(),
                provided_password,
            )?
            .ok_or_else(|| {
                OperatorError::credential_generation(
                    format!("No credential issued for {} authentication", user.mode),
                    false,
                )
            })?;

        let desired = desired_secret(user, owner_reference(user, uid), &resolved.credential);
        let outcome = self.secrets.sync(&desired).await?;

        let scram_password = match resolved.credential {
            Credential::Scram { password } => Some(password),
            Credential::Tls { .. } => None,
        };
        Ok(CredentialState {
            secret: Some(outcome),
            reused: resolved.reused,
            scram_password,
        })
    }

    /// Write `status` unless this pass has been superseded or changes nothing.
    async fn commit_status(
        &self,
        key: &str,
        namespace: &str,
        name: &str,
        generation: i64,
        status: &UserStatus,
    ) -> Result<CommitOutcome> {
        if self.registry.is_superseded(key, generation) {
            return Ok(CommitOutcome::Superseded);
        }

        let users = &self.users;
        let current = self
            .config
            .retry
            .run(Step::ControlPlane, "get_user", move || users.get(namespace, name))
            .await?;
        let Some(current) = current else {
            return Ok(CommitOutcome::Gone);
        };

        let current_generation = current.metadata.generation.unwrap_or_default();
        if current_generation > generation {
            self.registry.observe(key, current_generation);
            debug!(generation, current_generation, "Pass superseded, dropping status");
            return Ok(CommitOutcome::Superseded);
        }
        if status_unchanged(current.status.as_ref(), status) {
            return Ok(CommitOutcome::Unchanged);
        }

        let written = self
            .config
            .retry
            .run(Step::ControlPlane, "patch_user_status", move || {
                users.patch_status(namespace, name, status)
            })
            .await?;
        Ok(if written {
            CommitOutcome::Written
        } else {
            CommitOutcome::Gone
        })
    }

    /// Remove everything the broker holds for a deleted user.
    ///
    /// The credentials secret is left to owner-reference garbage collection.
    #[instrument(skip(self, user), fields(name = %user.name_any(), namespace = user.namespace()))]
    pub async fn delete(&self, user: &StreamlineUser) -> Result<ApplyReport> {
        let namespace = user.namespace().unwrap_or_else(|| "default".to_string());
        let name = user.name_any();
        let key = record_key(&namespace, &name);
        let _guard = self.registry.acquire(&key).await;

        let stored = user.status.as_ref().and_then(|s| s.username.clone());
        let derived = AuthenticationMode::parse(user.spec.authentication.as_ref())
            .map(|mode| mode.username(&name))
            .ok();

        let mut principals: Vec<String> = stored.into_iter().chain(derived).collect();
        principals.dedup();
        if principals.is_empty() {
            principals.push(name.clone());
        }

        let mut report = ApplyReport::default();
        for principal in &principals {
            report.merge(self.broker.clear(principal).await?);
        }
        self.registry.forget(&key);

        info!(principals = ?principals, "Cleared broker state of deleted user");
        Ok(report)
    }
}

fn owner_reference(user: &ValidatedUser, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: StreamlineUser::api_version(&()).to_string(),
        kind: StreamlineUser::kind(&()).to_string(),
        name: user.name.clone(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
