//! In-memory fakes of the user store, secret store and broker for tests

use crate::broker::{acl_principal, AclBinding, BrokerAdmin, QuotaChange, QuotaSet, SCRAM_MECHANISM};
use crate::crd::{StreamlineUser, UserSpec, UserStatus};
use crate::error::{OperatorError, Result};
use crate::secrets::SecretStore;
use crate::store::UserStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::Resource;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Failure = Mutex<Option<(String, bool)>>;

/// A user record with a uid and generation 1
pub fn user(namespace: &str, name: &str, spec: UserSpec) -> StreamlineUser {
    let mut user = StreamlineUser::new(name, spec);
    user.metadata.namespace = Some(namespace.to_string());
    user.metadata.uid = Some(format!("uid-{}", name));
    user.metadata.generation = Some(1);
    user
}

pub fn owner_ref(name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: StreamlineUser::api_version(&()).to_string(),
        kind: StreamlineUser::kind(&()).to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn secret_with(name: &str, entries: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Throwaway clients CA as (certificate PEM, key PEM)
pub fn test_ca() -> (String, String) {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, "clients-ca");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "streamline.io");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().expect("Failed to generate CA key");
    let cert = params.self_signed(&key).expect("Failed to self-sign CA");
    (cert.pem(), key.serialize_pem())
}

fn take_failure(failure: &Failure) -> Option<(String, bool)> {
    failure.lock().unwrap().clone()
}

#[derive(Default)]
struct BrokerState {
    quotas: BTreeMap<String, QuotaSet>,
    acls: BTreeSet<AclBinding>,
    scram: BTreeMap<String, String>,
}

/// Broker admin API keeping ACLs, quotas and SCRAM credentials in memory
#[derive(Default)]
pub struct FakeBroker {
    state: Mutex<BrokerState>,
    writes: AtomicUsize,
    failure: Failure,
}

impl FakeBroker {
    /// Make every call fail until [`FakeBroker::recover`]
    pub fn fail(&self, message: &str, transient: bool) {
        *self.failure.lock().unwrap() = Some((message.to_string(), transient));
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn scram_password(&self, principal: &str) -> Option<String> {
        self.state.lock().unwrap().scram.get(principal).cloned()
    }

    pub fn acls_for(&self, principal: &str) -> Vec<AclBinding> {
        let principal = acl_principal(principal);
        self.state
            .lock()
            .unwrap()
            .acls
            .iter()
            .filter(|binding| binding.principal == principal)
            .cloned()
            .collect()
    }

    pub fn quotas_for(&self, principal: &str) -> QuotaSet {
        self.state
            .lock()
            .unwrap()
            .quotas
            .get(principal)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        match take_failure(&self.failure) {
            Some((message, transient)) => Err(OperatorError::broker(message, transient)),
            None => Ok(()),
        }
    }

    fn write(&self) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BrokerAdmin for FakeBroker {
    async fn describe_quotas(&self, principal: &str) -> Result<QuotaSet> {
        self.check()?;
        Ok(self.quotas_for(principal))
    }

    async fn alter_quotas(&self, principal: &str, changes: &[QuotaChange]) -> Result<()> {
        self.write()?;
        let mut state = self.state.lock().unwrap();
        let quotas = state.quotas.entry(principal.to_string()).or_default();
        for change in changes {
            match change.value {
                Some(value) => quotas.insert(change.key, value),
                None => quotas.remove(&change.key),
            };
        }
        if quotas.is_empty() {
            state.quotas.remove(principal);
        }
        Ok(())
    }

    async fn describe_acls(&self, principal: &str) -> Result<Vec<AclBinding>> {
        self.check()?;
        Ok(self.acls_for(principal))
    }

    async fn create_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        self.write()?;
        self.state
            .lock()
            .unwrap()
            .acls
            .extend(bindings.iter().cloned());
        Ok(())
    }

    async fn delete_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        self.write()?;
        let mut state = self.state.lock().unwrap();
        for binding in bindings {
            state.acls.remove(binding);
        }
        Ok(())
    }

    async fn scram_mechanisms(&self, principal: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .scram_password(principal)
            .map(|_| vec![SCRAM_MECHANISM.to_string()])
            .unwrap_or_default())
    }

    async fn upsert_scram_credential(
        &self,
        principal: &str,
        password: &str,
        _iterations: u32,
    ) -> Result<()> {
        self.write()?;
        self.state
            .lock()
            .unwrap()
            .scram
            .insert(principal.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_scram_credential(&self, principal: &str) -> Result<()> {
        self.write()?;
        self.state.lock().unwrap().scram.remove(principal);
        Ok(())
    }
}

/// Secret store keyed by (namespace, name)
#[derive(Default)]
pub struct FakeSecretStore {
    secrets: Mutex<BTreeMap<(String, String), Secret>>,
    writes: AtomicUsize,
    failure: Failure,
}

impl FakeSecretStore {
    pub fn insert(&self, namespace: &str, mut secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        secret.metadata.namespace = Some(namespace.to_string());
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all secrets in a namespace
    pub fn names(&self, namespace: &str) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail(&self, message: &str, transient: bool) {
        *self.failure.lock().unwrap() = Some((message.to_string(), transient));
    }

    fn check(&self) -> Result<()> {
        match take_failure(&self.failure) {
            Some((message, transient)) => Err(OperatorError::secret_sync(message, transient)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.check()?;
        Ok(self.secret(namespace, name))
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(namespace, secret.clone());
        Ok(())
    }

    async fn replace(&self, namespace: &str, secret: &Secret) -> Result<()> {
        self.create(namespace, secret).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

/// User records with a status patch counter
#[derive(Default)]
pub struct FakeUserStore {
    users: Mutex<BTreeMap<(String, String), StreamlineUser>>,
    patches: AtomicUsize,
}

impl FakeUserStore {
    pub fn insert(&self, user: StreamlineUser) {
        let key = (
            user.metadata.namespace.clone().unwrap_or_default(),
            user.metadata.name.clone().unwrap_or_default(),
        );
        self.users.lock().unwrap().insert(key, user);
    }

    pub fn user(&self, namespace: &str, name: &str) -> Option<StreamlineUser> {
        self.users
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.users
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Replace the spec and bump the generation, as the API server does
    pub fn update_spec(&self, namespace: &str, name: &str, spec: UserSpec) -> StreamlineUser {
        let mut users = self.users.lock().unwrap();
        let user = users
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("user exists");
        user.spec = spec;
        user.metadata.generation = Some(user.metadata.generation.unwrap_or_default() + 1);
        user.clone()
    }

    pub fn patch_calls(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserStore for FakeUserStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StreamlineUser>> {
        Ok(self.user(namespace, name))
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &UserStatus,
    ) -> Result<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(user) => {
                self.patches.fetch_add(1, Ordering::SeqCst);
                user.status = Some(status.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
