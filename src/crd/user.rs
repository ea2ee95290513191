//! StreamlineUser Custom Resource Definition
//!
//! Declares the desired credentials, ACLs and quotas of one broker principal.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// StreamlineUser is the Schema for the streamlineusers API
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "streamline.io",
    version = "v1alpha1",
    kind = "StreamlineUser",
    namespaced,
    status = "UserStatus",
    shortname = "slu",
    printcolumn = r#"{"name":"Authentication","type":"string","jsonPath":".spec.authentication.type"}"#,
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".status.username"}"#,
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".status.secret"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Authentication configuration; no authentication when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<UserAuthentication>,

    /// Authorization configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<UserAuthorization>,

    /// Quotas for the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quotas: Option<UserQuotas>,

    /// Prefix for the generated secret name, overriding the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name_prefix: Option<String>,

    /// Metadata templates for generated resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<UserTemplate>,
}

/// User authentication configuration
///
/// The type is kept as a string here and validated by the reconciler so an
/// unknown value surfaces as a NotReady condition instead of a watch error.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthentication {
    /// Authentication type (tls, tls-external, scram-sha-512)
    pub r#type: String,

    /// Externally provided password (scram-sha-512 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordSource>,
}

/// Source of a user-provided password
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSource {
    pub value_from: PasswordValueFrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordValueFrom {
    pub secret_key_ref: SecretKeySelector,
}

/// Reference to a key in a Kubernetes secret of the same namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SecretKeySelector {
    /// Name of the secret
    pub name: String,
    /// Key within the secret containing the password
    #[serde(default = "default_password_key")]
    pub key: String,
}

/// User authorization configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserAuthorization {
    /// Authorization type
    #[serde(default)]
    pub r#type: AuthorizationType,

    /// ACL rules for the user
    #[serde(default)]
    pub acls: Vec<UserAcl>,
}

/// Authorization type
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationType {
    /// Simple ACL-based authorization
    #[default]
    Simple,
}

/// ACL rule for the user
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserAcl {
    /// Resource type (topic, group, cluster, transactionalId)
    pub resource_type: ResourceType,

    /// Resource name (exact or prefix); ignored for the cluster resource
    #[serde(default)]
    pub resource_name: String,

    /// Pattern type (literal, prefixed)
    #[serde(default)]
    pub pattern_type: PatternType,

    /// Operations the rule applies to
    pub operations: Vec<AclOperation>,

    /// Permission type (allow or deny)
    #[serde(default)]
    pub permission: PermissionType,

    /// Host the rule applies to
    #[serde(default = "default_acl_host")]
    pub host: String,
}

/// Resource type for ACL
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    /// Topic resource
    Topic,
    /// Consumer group resource
    Group,
    /// Cluster resource
    Cluster,
    /// Transactional ID resource
    TransactionalId,
}

/// Pattern type for resource matching
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    JsonSchema,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "camelCase")]
pub enum PatternType {
    /// Exact match
    #[default]
    Literal,
    /// Prefix match
    Prefixed,
}

/// Operation covered by an ACL rule
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum AclOperation {
    Read,
    Write,
    Create,
    Delete,
    Alter,
    Describe,
    ClusterAction,
    DescribeConfigs,
    AlterConfigs,
    IdempotentWrite,
    All,
}

/// Permission type (allow or deny)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    JsonSchema,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "camelCase")]
pub enum PermissionType {
    /// Allow the operation
    #[default]
    Allow,
    /// Deny the operation
    Deny,
}

/// User quotas; every dimension is optional
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserQuotas {
    /// Producer byte rate limit (bytes/sec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_byte_rate: Option<i64>,
    /// Consumer byte rate limit (bytes/sec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_byte_rate: Option<i64>,
    /// Share of request handler and network thread time (percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_percentage: Option<i32>,
    /// Rate of partition mutations (mutations/sec)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_mutation_rate: Option<f64>,
}

/// Templates for resources created on behalf of the user
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ResourceTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    #[serde(default)]
    pub metadata: MetadataTemplate,
}

/// Extra labels and annotations for a generated resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Status of the StreamlineUser
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing user state
    #[serde(default)]
    pub conditions: Vec<UserCondition>,

    /// Principal name used by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Secret holding the generated credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Condition of the user
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

fn default_password_key() -> String {
    "password".to_string()
}

fn default_acl_host() -> String {
    "*".to_string()
}
