//! Streamline User Operator
//!
//! A Kubernetes operator that turns `StreamlineUser` records into broker
//! principals: it issues TLS certificates or SCRAM passwords, stores them in a
//! Secret owned by the record, and keeps the broker's ACLs, quotas and SCRAM
//! credentials in line with the record.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: streamline.io/v1alpha1
//! kind: StreamlineUser
//! metadata:
//!   name: my-user
//! spec:
//!   authentication:
//!     type: scram-sha-512
//!   authorization:
//!     type: simple
//!     acls:
//!       - resourceType: topic
//!         resourceName: orders
//!         operations: [Read, Describe]
//!   quotas:
//!     producerByteRate: 1048576
//! ```

pub mod broker;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod secrets;
pub mod status;
pub mod store;
pub mod validation;

#[cfg(test)]
mod testing;

pub use config::{OperatorArgs, ReconcilerConfig};
pub use controllers::UserController;
pub use crd::{StreamlineUser, UserSpec, UserStatus};
pub use error::{OperatorError, Result};
pub use reconciler::{CommitOutcome, PassReport, Reconciler};
