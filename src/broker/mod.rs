//! Broker authorization, quota and SCRAM credential adapter
//!
//! [`BrokerAdmin`] is the seam to the broker's admin API; [`BrokerAdapter`]
//! turns a desired state into the minimal set of admin calls against it.

mod http;

pub use http::{HttpBrokerAdmin, HttpBrokerAdminConfig};

use crate::crd::{AclOperation, PatternType, PermissionType, ResourceType};
use crate::error::Result;
use crate::retry::{RetryPolicy, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// The only SCRAM mechanism the operator manages
pub const SCRAM_MECHANISM: &str = "SCRAM-SHA-512";

/// Default PBKDF2 iteration count for SCRAM credentials
pub const DEFAULT_SCRAM_ITERATIONS: u32 = 4096;

/// ACL principal for a broker username
pub fn acl_principal(username: &str) -> String {
    format!("User:{}", username)
}

/// A single ACL entry as stored by the broker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclBinding {
    pub principal: String,
    pub resource_type: ResourceType,
    pub pattern_type: PatternType,
    pub resource_name: String,
    pub operation: AclOperation,
    pub permission: PermissionType,
    pub host: String,
}

impl fmt::Display for AclBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(principal={}, host={}, operation={:?}, permissionType={:?}) on {:?}:{:?}:{}",
            self.principal,
            self.host,
            self.operation,
            self.permission,
            self.resource_type,
            self.pattern_type,
            self.resource_name
        )
    }
}

/// Client quota dimensions managed per principal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKey {
    ProducerByteRate,
    ConsumerByteRate,
    RequestPercentage,
    ControllerMutationRate,
}

impl QuotaKey {
    pub const ALL: [QuotaKey; 4] = [
        QuotaKey::ProducerByteRate,
        QuotaKey::ConsumerByteRate,
        QuotaKey::RequestPercentage,
        QuotaKey::ControllerMutationRate,
    ];

    /// Broker config name of the dimension
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaKey::ProducerByteRate => "producer_byte_rate",
            QuotaKey::ConsumerByteRate => "consumer_byte_rate",
            QuotaKey::RequestPercentage => "request_percentage",
            QuotaKey::ControllerMutationRate => "controller_mutation_rate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        QuotaKey::ALL.into_iter().find(|key| key.as_str() == s)
    }
}

/// Quota overrides of one principal
pub type QuotaSet = BTreeMap<QuotaKey, f64>;

/// Set (`Some`) or remove (`None`) one quota override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaChange {
    pub key: QuotaKey,
    pub value: Option<f64>,
}

/// Admin operations the broker exposes for one principal.
///
/// `principal` is the broker username, e.g. `CN=alice` or `alice`.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn describe_quotas(&self, principal: &str) -> Result<QuotaSet>;

    async fn alter_quotas(&self, principal: &str, changes: &[QuotaChange]) -> Result<()>;

    async fn describe_acls(&self, principal: &str) -> Result<Vec<AclBinding>>;

    async fn create_acls(&self, bindings: &[AclBinding]) -> Result<()>;

    async fn delete_acls(&self, bindings: &[AclBinding]) -> Result<()>;

    /// SCRAM mechanisms the principal has credentials for
    async fn scram_mechanisms(&self, principal: &str) -> Result<Vec<String>>;

    async fn upsert_scram_credential(
        &self,
        principal: &str,
        password: &str,
        iterations: u32,
    ) -> Result<()>;

    async fn delete_scram_credential(&self, principal: &str) -> Result<()>;
}

/// Desired SCRAM credential state for a principal
#[derive(Debug, Clone, Copy)]
pub enum ScramSync<'a> {
    /// The principal must not have a SCRAM credential
    Absent,
    /// The principal must authenticate with `password`; `rotated` forces an
    /// upsert even when the broker already holds a credential
    Present { password: &'a str, rotated: bool },
}

/// What an apply or clear call changed at the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub acls_created: usize,
    pub acls_deleted: usize,
    pub quotas_changed: usize,
    pub scram_updated: bool,
    pub scram_deleted: bool,
}

impl ApplyReport {
    /// True when no write call was issued
    pub fn is_noop(&self) -> bool {
        *self == ApplyReport::default()
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.acls_created += other.acls_created;
        self.acls_deleted += other.acls_deleted;
        self.quotas_changed += other.quotas_changed;
        self.scram_updated |= other.scram_updated;
        self.scram_deleted |= other.scram_deleted;
    }
}

/// Everything the broker knows about a principal
#[derive(Debug, Clone, Default)]
pub struct PrincipalDescription {
    pub principal: String,
    pub quotas: QuotaSet,
    pub acls: Vec<AclBinding>,
    pub scram_mechanisms: Vec<String>,
}

impl PrincipalDescription {
    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty() && self.acls.is_empty() && self.scram_mechanisms.is_empty()
    }
}

impl fmt::Display for PrincipalDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.quotas.is_empty() {
            let configs: Vec<String> = self
                .quotas
                .iter()
                .map(|(key, value)| format!("{}={:?}", key.as_str(), value))
                .collect();
            writeln!(
                f,
                "Quota configs for user-principal '{}' are {}",
                self.principal,
                configs.join(", ")
            )?;
        }
        if !self.scram_mechanisms.is_empty() {
            writeln!(
                f,
                "SCRAM credential configs for user-principal '{}' are {}",
                self.principal,
                self.scram_mechanisms.join(", ")
            )?;
        }
        if !self.acls.is_empty() {
            writeln!(
                f,
                "Current ACLs for principal `{}`:",
                acl_principal(&self.principal)
            )?;
            for acl in &self.acls {
                writeln!(f, "  {}", acl)?;
            }
        }
        Ok(())
    }
}

/// Split the broker's current bindings into (to create, to delete).
pub fn diff_acls(
    desired: &BTreeSet<AclBinding>,
    current: &[AclBinding],
) -> (Vec<AclBinding>, Vec<AclBinding>) {
    let current: BTreeSet<&AclBinding> = current.iter().collect();
    let to_create = desired
        .iter()
        .filter(|binding| !current.contains(binding))
        .cloned()
        .collect();
    let to_delete = current
        .into_iter()
        .filter(|binding| !desired.contains(*binding))
        .cloned()
        .collect();
    (to_create, to_delete)
}

/// Changes that make `current` equal to `desired` on the four managed dimensions.
pub fn quota_changes(desired: &QuotaSet, current: &QuotaSet) -> Vec<QuotaChange> {
    QuotaKey::ALL
        .into_iter()
        .filter_map(|key| match (desired.get(&key), current.get(&key)) {
            (Some(want), Some(have)) if (want - have).abs() < f64::EPSILON => None,
            (Some(want), _) => Some(QuotaChange {
                key,
                value: Some(*want),
            }),
            (None, Some(_)) => Some(QuotaChange { key, value: None }),
            (None, None) => None,
        })
        .collect()
}

/// Drives a principal's ACLs, quotas and SCRAM credential to a desired state.
#[derive(Clone)]
pub struct BrokerAdapter {
    admin: Arc<dyn BrokerAdmin>,
    retry: RetryPolicy,
    scram_iterations: u32,
}

impl BrokerAdapter {
    pub fn new(admin: Arc<dyn BrokerAdmin>, retry: RetryPolicy) -> Self {
        Self {
            admin,
            retry,
            scram_iterations: DEFAULT_SCRAM_ITERATIONS,
        }
    }

    pub fn with_scram_iterations(mut self, iterations: u32) -> Self {
        self.scram_iterations = iterations;
        self
    }

    /// Apply the full desired state for `principal`.
    ///
    /// Re-applying an unchanged state issues only describe calls.
    pub async fn apply(
        &self,
        principal: &str,
        acls: &BTreeSet<AclBinding>,
        quotas: &QuotaSet,
        scram: ScramSync<'_>,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        self.sync_scram(principal, scram, &mut report).await?;
        self.sync_acls(principal, acls, &mut report).await?;
        self.sync_quotas(principal, quotas, &mut report).await?;

        if report.is_noop() {
            debug!(principal, "Broker state already matches desired state");
        } else {
            info!(
                principal,
                acls_created = report.acls_created,
                acls_deleted = report.acls_deleted,
                quotas_changed = report.quotas_changed,
                scram_updated = report.scram_updated,
                scram_deleted = report.scram_deleted,
                "Applied broker state"
            );
        }
        Ok(report)
    }

    /// Remove every ACL, quota override and SCRAM credential of `principal`.
    pub async fn clear(&self, principal: &str) -> Result<ApplyReport> {
        info!(principal, "Clearing broker state for principal");
        self.apply(principal, &BTreeSet::new(), &QuotaSet::new(), ScramSync::Absent)
            .await
    }

    /// Read back everything the broker holds for `principal`.
    pub async fn describe(&self, principal: &str) -> Result<PrincipalDescription> {
        let admin = &self.admin;
        let quotas = self
            .retry
            .run(Step::BrokerAdapter, "describe_quotas", move || {
                admin.describe_quotas(principal)
            })
            .await?;
        let acls = self
            .retry
            .run(Step::BrokerAdapter, "describe_acls", move || {
                admin.describe_acls(principal)
            })
            .await?;
        let scram_mechanisms = self
            .retry
            .run(Step::BrokerAdapter, "describe_scram", move || {
                admin.scram_mechanisms(principal)
            })
            .await?;
        Ok(PrincipalDescription {
            principal: principal.to_string(),
            quotas,
            acls,
            scram_mechanisms,
        })
    }

    async fn sync_scram(
        &self,
        principal: &str,
        scram: ScramSync<'_>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let admin = &self.admin;
        let mechanisms = self
            .retry
            .run(Step::BrokerAdapter, "describe_scram", move || {
                admin.scram_mechanisms(principal)
            })
            .await?;
        let present = mechanisms.iter().any(|m| m == SCRAM_MECHANISM);

        match scram {
            ScramSync::Present { password, rotated } if rotated || !present => {
                let iterations = self.scram_iterations;
                self.retry
                    .run(Step::BrokerAdapter, "upsert_scram_credential", move || {
                        admin.upsert_scram_credential(principal, password, iterations)
                    })
                    .await?;
                report.scram_updated = true;
            }
            ScramSync::Absent if present => {
                self.retry
                    .run(Step::BrokerAdapter, "delete_scram_credential", move || {
                        admin.delete_scram_credential(principal)
                    })
                    .await?;
                report.scram_deleted = true;
            }
            _ => {}
        }
        Ok(())
    }

    async fn sync_acls(
        &self,
        principal: &str,
        desired: &BTreeSet<AclBinding>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let admin = &self.admin;
        let current = self
            .retry
            .run(Step::BrokerAdapter, "describe_acls", move || {
                admin.describe_acls(principal)
            })
            .await?;
        let (to_create, to_delete) = diff_acls(desired, &current);

        if !to_delete.is_empty() {
            let bindings = to_delete.as_slice();
            self.retry
                .run(Step::BrokerAdapter, "delete_acls", move || {
                    admin.delete_acls(bindings)
                })
                .await?;
            report.acls_deleted = to_delete.len();
        }
        if !to_create.is_empty() {
            let bindings = to_create.as_slice();
            self.retry
                .run(Step::BrokerAdapter, "create_acls", move || {
                    admin.create_acls(bindings)
                })
                .await?;
            report.acls_created = to_create.len();
        }
        Ok(())
    }

    async fn sync_quotas(
        &self,
        principal: &str,
        desired: &QuotaSet,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let admin = &self.admin;
        let current = self
            .retry
            .run(Step::BrokerAdapter, "describe_quotas", move || {
                admin.describe_quotas(principal)
            })
            .await?;
        let changes = quota_changes(desired, &current);
        if changes.is_empty() {
            return Ok(());
        }

        let changes_ref = changes.as_slice();
        self.retry
            .run(Step::BrokerAdapter, "alter_quotas", move || {
                admin.alter_quotas(principal, changes_ref)
            })
            .await?;
        report.quotas_changed = changes.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBroker;

    fn binding(principal: &str, topic: &str, operation: AclOperation) -> AclBinding {
        AclBinding {
            principal: acl_principal(principal),
            resource_type: ResourceType::Topic,
            pattern_type: PatternType::Literal,
            resource_name: topic.to_string(),
            operation,
            permission: PermissionType::Allow,
            host: "*".to_string(),
        }
    }

    fn adapter(broker: &Arc<FakeBroker>) -> BrokerAdapter {
        BrokerAdapter::new(broker.clone(), RetryPolicy::default())
    }

    fn quota_set(values: &[(QuotaKey, f64)]) -> QuotaSet {
        values.iter().copied().collect()
    }

    #[test]
    fn test_quota_key_names() {
        assert_eq!(QuotaKey::ProducerByteRate.as_str(), "producer_byte_rate");
        assert_eq!(
            QuotaKey::parse("controller_mutation_rate"),
            Some(QuotaKey::ControllerMutationRate)
        );
        assert_eq!(QuotaKey::parse("connection_creation_rate"), None);
    }

    #[test]
    fn test_diff_acls_leaves_unchanged_rules_alone() {
        let keep = binding("alice", "orders", AclOperation::Read);
        let stale = binding("alice", "orders", AclOperation::Write);
        let new = binding("alice", "payments", AclOperation::Read);

        let desired: BTreeSet<AclBinding> = [keep.clone(), new.clone()].into_iter().collect();
        let (to_create, to_delete) = diff_acls(&desired, &[keep, stale.clone()]);

        assert_eq!(to_create, vec![new]);
        assert_eq!(to_delete, vec![stale]);
    }

    #[test]
    fn test_quota_changes_full_replace() {
        let desired = quota_set(&[
            (QuotaKey::ProducerByteRate, 1111.0),
            (QuotaKey::RequestPercentage, 42.0),
        ]);
        let current = quota_set(&[
            (QuotaKey::ProducerByteRate, 1111.0),
            (QuotaKey::ConsumerByteRate, 2222.0),
            (QuotaKey::RequestPercentage, 10.0),
        ]);

        let changes = quota_changes(&desired, &current);
        assert_eq!(
            changes,
            vec![
                QuotaChange {
                    key: QuotaKey::ConsumerByteRate,
                    value: None
                },
                QuotaChange {
                    key: QuotaKey::RequestPercentage,
                    value: Some(42.0)
                },
            ]
        );
        assert!(quota_changes(&desired, &desired).is_empty());
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let broker = Arc::new(FakeBroker::default());
        let adapter = adapter(&broker);
        let acls: BTreeSet<AclBinding> = [binding("alice", "orders", AclOperation::Read)]
            .into_iter()
            .collect();
        let quotas = quota_set(&[(QuotaKey::ProducerByteRate, 1024.0)]);

        let first = adapter
            .apply("alice", &acls, &quotas, ScramSync::Absent)
            .await
            .unwrap();
        assert_eq!(first.acls_created, 1);
        assert_eq!(first.quotas_changed, 1);

        let writes = broker.write_calls();
        let second = adapter
            .apply("alice", &acls, &quotas, ScramSync::Absent)
            .await
            .unwrap();
        assert!(second.is_noop());
        assert_eq!(broker.write_calls(), writes);
    }

    #[tokio::test]
    async fn test_scram_credential_upserted_only_when_needed() {
        let broker = Arc::new(FakeBroker::default());
        let adapter = adapter(&broker);
        let empty = BTreeSet::new();
        let no_quotas = QuotaSet::new();

        let report = adapter
            .apply(
                "bob",
                &empty,
                &no_quotas,
                ScramSync::Present {
                    password: "secret",
                    rotated: false,
                },
            )
            .await
            .unwrap();
        assert!(report.scram_updated);
        assert_eq!(broker.scram_password("bob").as_deref(), Some("secret"));

        let report = adapter
            .apply(
                "bob",
                &empty,
                &no_quotas,
                ScramSync::Present {
                    password: "secret",
                    rotated: false,
                },
            )
            .await
            .unwrap();
        assert!(report.is_noop());

        let report = adapter
            .apply(
                "bob",
                &empty,
                &no_quotas,
                ScramSync::Present {
                    password: "rotated",
                    rotated: true,
                },
            )
            .await
            .unwrap();
        assert!(report.scram_updated);
        assert_eq!(broker.scram_password("bob").as_deref(), Some("rotated"));

        let report = adapter
            .apply("bob", &empty, &no_quotas, ScramSync::Absent)
            .await
            .unwrap();
        assert!(report.scram_deleted);
        assert!(broker.scram_password("bob").is_none());
    }

    #[tokio::test]
    async fn test_quotas_reported_and_cleared() {
        let broker = Arc::new(FakeBroker::default());
        let adapter = adapter(&broker);
        let quotas = quota_set(&[
            (QuotaKey::ProducerByteRate, 1111.0),
            (QuotaKey::ConsumerByteRate, 2222.0),
            (QuotaKey::RequestPercentage, 42.0),
            (QuotaKey::ControllerMutationRate, 10.0),
        ]);

        adapter
            .apply("CN=arnost", &BTreeSet::new(), &quotas, ScramSync::Absent)
            .await
            .unwrap();

        let description = adapter.describe("CN=arnost").await.unwrap().to_string();
        assert!(description.contains("Quota configs for user-principal 'CN=arnost' are"));
        assert!(description.contains("producer_byte_rate=1111"));
        assert!(description.contains("consumer_byte_rate=2222"));
        assert!(description.contains("request_percentage=42"));
        assert!(description.contains("controller_mutation_rate=10.0"));

        adapter.clear("CN=arnost").await.unwrap();

        let description = adapter.describe("CN=arnost").await.unwrap();
        assert!(description.is_empty());
        let text = description.to_string();
        assert!(!text.contains("CN=arnost"));
        for key in QuotaKey::ALL {
            assert!(!text.contains(key.as_str()));
        }
    }

    #[tokio::test]
    async fn test_clear_removes_acls() {
        let broker = Arc::new(FakeBroker::default());
        let adapter = adapter(&broker);
        let acls: BTreeSet<AclBinding> = [
            binding("carol", "orders", AclOperation::Read),
            binding("carol", "orders", AclOperation::Describe),
        ]
        .into_iter()
        .collect();
        adapter
            .apply("carol", &acls, &QuotaSet::new(), ScramSync::Absent)
            .await
            .unwrap();
        assert_eq!(broker.acls_for("carol").len(), 2);

        let report = adapter.clear("carol").await.unwrap();
        assert_eq!(report.acls_deleted, 2);
        assert!(broker.acls_for("carol").is_empty());
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces_as_broker_error() {
        let broker = Arc::new(FakeBroker::default());
        broker.fail("unreachable", false);
        let err = adapter(&broker)
            .apply("dave", &BTreeSet::new(), &QuotaSet::new(), ScramSync::Absent)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "BrokerAdapterFailed");
    }
}
