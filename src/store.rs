//! Access to StreamlineUser records and their status subresource

use crate::crd::{StreamlineUser, UserStatus};
use crate::error::Result;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::debug;

/// Control-plane storage of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Current version of the record, `None` once it is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StreamlineUser>>;

    /// Write the status of a record.
    ///
    /// Returns `false` when the record no longer exists.
    async fn patch_status(&self, namespace: &str, name: &str, status: &UserStatus)
        -> Result<bool>;
}

/// [`UserStore`] backed by the Kubernetes API
pub struct KubeUserStore {
    client: Client,
}

impl KubeUserStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserStore for KubeUserStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<StreamlineUser>> {
        let users: Api<StreamlineUser> = Api::namespaced(self.client.clone(), namespace);
        Ok(users.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &UserStatus,
    ) -> Result<bool> {
        let users: Api<StreamlineUser> = Api::namespaced(self.client.clone(), namespace);
        // Absent fields must be sent as null or the merge patch keeps the old value
        let mut body = serde_json::to_value(status)?;
        if let Some(fields) = body.as_object_mut() {
            for key in ["observedGeneration", "username", "secret"] {
                fields.entry(key).or_insert(serde_json::Value::Null);
            }
        }
        let patch = serde_json::json!({ "status": body });

        match users
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(namespace, user = name, "User gone before status update");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
