//! Custom Resource Definitions for the Streamline user operator
//!
//! - StreamlineUser: a broker principal with credentials, ACLs and quotas

mod user;

pub use user::{
    AclOperation, AuthorizationType, MetadataTemplate, PasswordSource, PasswordValueFrom,
    PatternType, PermissionType, ResourceTemplate, ResourceType, SecretKeySelector,
    StreamlineUser, UserAcl, UserAuthentication, UserAuthorization, UserCondition, UserQuotas,
    UserSpec, UserStatus, UserTemplate,
};
