//! User Controller
//!
//! Watches StreamlineUser custom resources, keeps the cleanup finalizer on them
//! and runs a reconcile or deletion pass for every change.

use crate::broker::BrokerAdmin;
use crate::conditions::USER_FINALIZER;
use crate::config::ReconcilerConfig;
use crate::controllers::error_backoff;
use crate::crd::StreamlineUser;
use crate::error::{OperatorError, Result};
use crate::reconciler::Reconciler;
use crate::registry::record_key;
use crate::secrets::KubeSecretStore;
use crate::store::KubeUserStore;
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "streamline-user-operator";

/// Context for the user controller
pub struct UserController {
    client: Client,
    reconciler: Reconciler,
    /// Namespace to watch, `None` for all namespaces
    namespace: Option<String>,
    /// Consecutive failures per record, for backoff
    error_counts: DashMap<String, u32>,
}

impl UserController {
    /// Create a user controller talking to the cluster through `client` and
    /// to the brokers through `broker`.
    pub fn new(
        client: Client,
        broker: Arc<dyn BrokerAdmin>,
        config: ReconcilerConfig,
        namespace: Option<String>,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::new(KubeUserStore::new(client.clone())),
            Arc::new(KubeSecretStore::new(client.clone())),
            broker,
            config,
        );
        Self {
            client,
            reconciler,
            namespace,
            error_counts: DashMap::new(),
        }
    }

    /// Run the user controller until a shutdown signal arrives
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let users: Api<StreamlineUser> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };

        info!(
            namespace = self.namespace.as_deref().unwrap_or("all"),
            "Starting StreamlineUser controller"
        );

        Controller::new(users, Config::default())
            .shutdown_on_signal()
            .run(
                |user, ctx| async move { ctx.reconcile(user).await },
                |user, error, ctx| ctx.error_policy(&user, error),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!(name = %obj.name, namespace = ?obj.namespace, "Reconciled user");
                    }
                    Err(e) => {
                        warn!(error = %e, "Reconciliation failed");
                    }
                }
            })
            .await;

        info!("StreamlineUser controller stopped");
        Ok(())
    }

    /// Reconcile a StreamlineUser
    #[instrument(skip(self, user), fields(name = %user.name_any(), namespace = user.namespace()))]
    async fn reconcile(&self, user: Arc<StreamlineUser>) -> Result<Action> {
        let namespace = user.namespace().unwrap_or_else(|| "default".to_string());
        let key = record_key(&namespace, &user.name_any());

        if user.metadata.deletion_timestamp.is_some() {
            let action = self.handle_deletion(&user, &namespace).await?;
            self.error_counts.remove(&key);
            return Ok(action);
        }

        self.ensure_finalizer(&user, &namespace).await?;

        match self.reconciler.reconcile(&user).await {
            Ok(report) => {
                self.error_counts.remove(&key);
                debug!(
                    username = %report.username,
                    status = ?report.status,
                    "Pass finished"
                );
                Ok(Action::requeue(self.reconciler.config().resync_interval))
            }
            Err(e) if e.is_terminal() => {
                self.error_counts.remove(&key);
                info!(error = %e, "User is invalid, waiting for a spec change");
                Ok(Action::await_change())
            }
            Err(e) => Err(e),
        }
    }

    fn error_policy(&self, user: &StreamlineUser, error: &OperatorError) -> Action {
        let namespace = user.namespace().unwrap_or_else(|| "default".to_string());
        let key = record_key(&namespace, &user.name_any());
        let retries = {
            let mut entry = self.error_counts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        match error_backoff(error, retries) {
            Some(delay) => {
                warn!(
                    error = %error,
                    reason = error.reason(),
                    retry = retries,
                    delay_secs = delay.as_secs(),
                    "Reconciliation error for '{}', will retry",
                    key
                );
                Action::requeue(delay)
            }
            None => {
                warn!(
                    error = %error,
                    reason = error.reason(),
                    retry = retries,
                    "Reconciliation error for '{}', waiting for a change",
                    key
                );
                Action::await_change()
            }
        }
    }

    /// Ensure the finalizer is present on the resource
    async fn ensure_finalizer(&self, user: &StreamlineUser, namespace: &str) -> Result<()> {
        if has_finalizer(user) {
            return Ok(());
        }

        let users: Api<StreamlineUser> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": StreamlineUser::api_version(&()),
            "kind": StreamlineUser::kind(&()),
            "metadata": {
                "finalizers": [USER_FINALIZER]
            }
        });
        users
            .patch(
                &user.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;

        debug!("Added finalizer");
        Ok(())
    }

    /// Handle deletion: clear the principal at the broker, then remove the finalizer
    async fn handle_deletion(&self, user: &StreamlineUser, namespace: &str) -> Result<Action> {
        if !has_finalizer(user) {
            return Ok(Action::await_change());
        }

        let name = user.name_any();
        info!("Handling deletion of StreamlineUser {}/{}", namespace, name);

        self.reconciler.delete(user).await?;

        let users: Api<StreamlineUser> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = user
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != USER_FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        match users
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {}
            // Already gone
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        info!("Finalizer removed for StreamlineUser {}/{}", namespace, name);
        Ok(Action::await_change())
    }
}

fn has_finalizer(user: &StreamlineUser) -> bool {
    user.finalizers().iter().any(|f| f == USER_FINALIZER)
}
