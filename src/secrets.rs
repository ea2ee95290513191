//! Secret synchronization
//!
//! Keeps the credentials secret of a user equal to the generated credential:
//! created when missing, replaced wholesale when its content differs, and
//! left alone otherwise.

use crate::credentials::Credential;
use crate::crd::SecretKeySelector;
use crate::error::{kube_error_is_transient, OperatorError, Result};
use crate::retry::{RetryPolicy, Step};
use crate::validation::ValidatedUser;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// Labels the operator sets on every secret it owns
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_KIND: &str = "streamline.io/kind";
pub const LABEL_USER: &str = "streamline.io/user";

/// Labels a template may not override
pub const SYSTEM_LABELS: [&str; 5] = [
    LABEL_NAME,
    LABEL_MANAGED_BY,
    LABEL_INSTANCE,
    LABEL_KIND,
    LABEL_USER,
];

const MANAGED_BY: &str = "streamline-user-operator";

/// Storage of Kubernetes secrets by namespace and name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Replace the whole secret named after `secret.metadata.name`
    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// Delete a secret; a missing secret is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`SecretStore`] backed by the Kubernetes API
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn secret_error(operation: &str, namespace: &str, name: &str, err: kube::Error) -> OperatorError {
    OperatorError::secret_sync(
        format!("{} secret {}/{}: {}", operation, namespace, name, err),
        kube_error_is_transient(&err),
    )
}

fn secret_name(secret: &Secret) -> &str {
    secret.metadata.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| secret_error("get", namespace, name, e))
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<()> {
        self.api(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| secret_error("create", namespace, secret_name(secret), e))?;
        Ok(())
    }

    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret_name(secret);
        self.api(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
            .map_err(|e| secret_error("replace", namespace, name, e))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(secret_error("delete", namespace, name, e)),
        }
    }
}

/// Result of a sync call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    Created,
    Updated,
    Unchanged,
}

impl SecretOutcome {
    /// Whether the secret content was written
    pub fn written(self) -> bool {
        self != SecretOutcome::Unchanged
    }
}

/// Build the secret a user should have for `credential`.
pub fn desired_secret(user: &ValidatedUser, owner: OwnerReference, credential: &Credential) -> Secret {
    let mut labels = user.secret_template.labels.clone();
    let name = user.name.as_str();
    let values = ["streamline", MANAGED_BY, name, "StreamlineUser", name];
    for (key, value) in SYSTEM_LABELS.into_iter().zip(values) {
        labels.insert(key.to_string(), value.to_string());
    }
    let annotations = user.secret_template.annotations.clone();

    Secret {
        metadata: ObjectMeta {
            name: Some(user.secret_name.clone()),
            namespace: Some(user.namespace.clone()),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        data: Some(credential.to_secret_data(&user.username)),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

fn owned_by(secret: &Secret, owner_uid: &str) -> bool {
    secret
        .metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == owner_uid)
}

/// Content equality: data, type, labels, annotations and owners.
fn same_content(existing: &Secret, desired: &Secret) -> bool {
    fn or_empty<K: Ord, V>(map: &Option<BTreeMap<K, V>>) -> Vec<(&K, &V)> {
        map.iter().flatten().collect()
    }

    or_empty(&existing.data) == or_empty(&desired.data)
        && existing.type_.as_deref().unwrap_or("Opaque")
            == desired.type_.as_deref().unwrap_or("Opaque")
        && or_empty(&existing.metadata.labels) == or_empty(&desired.metadata.labels)
        && or_empty(&existing.metadata.annotations) == or_empty(&desired.metadata.annotations)
        && existing.metadata.owner_references == desired.metadata.owner_references
}

/// Writes and removes user credential secrets.
#[derive(Clone)]
pub struct SecretSynchronizer {
    store: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl SecretSynchronizer {
    pub fn new(store: Arc<dyn SecretStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &dyn SecretStore {
        self.store.as_ref()
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let store = &self.store;
        self.retry
            .run(Step::SecretSync, "get_secret", move || store.get(namespace, name))
            .await
    }

    /// Credential currently stored in a secret, if it holds one.
    pub async fn read_credential(&self, namespace: &str, name: &str) -> Result<Option<Credential>> {
        Ok(self
            .get(namespace, name)
            .await?
            .and_then(|secret| secret.data)
            .and_then(|data| Credential::from_secret_data(&data)))
    }

    /// Read a password the user supplied through a secret key reference.
    pub async fn read_password(&self, namespace: &str, selector: &SecretKeySelector) -> Result<String> {
        let secret = self.get(namespace, &selector.name).await?.ok_or_else(|| {
            OperatorError::credential_generation(
                format!(
                    "Secret {} with requested user password does not exist",
                    selector.name
                ),
                false,
            )
        })?;

        secret
            .data
            .as_ref()
            .and_then(|data| data.get(&selector.key))
            .and_then(|value| String::from_utf8(value.0.clone()).ok())
            .filter(|password| !password.is_empty())
            .ok_or_else(|| {
                OperatorError::credential_generation(
                    format!(
                        "Secret {} does not contain a password under key {}",
                        selector.name, selector.key
                    ),
                    false,
                )
            })
    }

    /// Make the stored secret equal to `desired`.
    ///
    /// An existing secret is only replaced when it is owned by the same record
    /// as `desired`; anything else is a conflict.
    pub async fn sync(&self, desired: &Secret) -> Result<SecretOutcome> {
        let namespace = desired.metadata.namespace.as_deref().unwrap_or("default");
        let name = secret_name(desired);
        let store = &self.store;
        let owner_uid = desired
            .metadata
            .owner_references
            .iter()
            .flatten()
            .find(|owner| owner.controller == Some(true))
            .map(|owner| owner.uid.as_str())
            .unwrap_or_default();

        match self.get(namespace, name).await? {
            Some(existing) if !owned_by(&existing, owner_uid) => {
                warn!(namespace, secret = name, "Secret exists but belongs to someone else");
                Err(OperatorError::secret_sync(
                    format!(
                        "Secret {}/{} already exists and is not owned by this user",
                        namespace, name
                    ),
                    false,
                ))
            }
            None => {
                self.retry
                    .run(Step::SecretSync, "create_secret", move || {
                        store.create(namespace, desired)
                    })
                    .await?;
                info!(namespace, secret = name, "Created user secret");
                Ok(SecretOutcome::Created)
            }
            Some(existing) if same_content(&existing, desired) => {
                debug!(namespace, secret = name, "User secret is up to date");
                Ok(SecretOutcome::Unchanged)
            }
            Some(_) => {
                self.retry
                    .run(Step::SecretSync, "replace_secret", move || {
                        store.replace(namespace, desired)
                    })
                    .await?;
                info!(namespace, secret = name, "Updated user secret");
                Ok(SecretOutcome::Updated)
            }
        }
    }

    /// Delete `name` if it is owned by the record with `owner_uid`.
    ///
    /// Returns whether a secret was deleted.
    pub async fn remove_owned(&self, namespace: &str, name: &str, owner_uid: &str) -> Result<bool> {
        let Some(existing) = self.get(namespace, name).await? else {
            return Ok(false);
        };

        if !owned_by(&existing, owner_uid) {
            warn!(namespace, secret = name, "Secret not owned by user, leaving it in place");
            return Ok(false);
        }

        let store = &self.store;
        self.retry
            .run(Step::SecretSync, "delete_secret", move || {
                store.delete(namespace, name)
            })
            .await?;
        info!(namespace, secret = name, "Deleted stale user secret");
        Ok(true)
    }
}
