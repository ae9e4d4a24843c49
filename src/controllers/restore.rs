//! Restore Controller
//!
//! Reconciles Restore custom resources: each event runs one pass of the
//! restore engine, persists the resulting status and requeues while work is
//! still in flight. Tasks created for a restore are cleaned up once it
//! completes or is deleted.

use crate::conditions::DATA_PROTECTION_FINALIZER;
use crate::config::RestoreSettings;
use crate::crd::Restore;
use crate::error::{OperatorError, Result};
use crate::restore::builder::{LABEL_MANAGED_BY, MANAGED_BY};
use crate::restore::{cleanup_tasks, KubePlatform, RestoreManager, RestoreProgress};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Annotation set on a Restore by the consuming reconciler once the target
/// workload is running
pub const WORKLOAD_READY_ANNOTATION: &str = "dataprotection.restore.io/workload-ready";

const FIELD_MANAGER: &str = "restore-operator";
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Whether the consuming reconciler reported the target workload ready.
pub fn is_workload_ready(restore: &Restore) -> bool {
    restore
        .annotations()
        .get(WORKLOAD_READY_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Context for the restore controller
pub struct RestoreController {
    client: Client,
    platform: KubePlatform,
    settings: RestoreSettings,
    namespace: Option<String>,
}

impl RestoreController {
    /// Create a new restore controller watching `namespace`, or every
    /// namespace when `None`
    pub fn new(client: Client, settings: RestoreSettings, namespace: Option<String>) -> Self {
        Self {
            platform: KubePlatform::new(client.clone()),
            client,
            settings,
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run the restore controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let restores: Api<Restore> = self.api();
        let jobs: Api<Job> = self.api();

        info!("Starting Restore controller");

        let owned_tasks = Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY));
        Controller::new(restores, Config::default())
            .owns(jobs, owned_tasks)
            .shutdown_on_signal()
            .run(
                |restore, ctx| async move { ctx.reconcile(restore).await },
                |restore, error, ctx| ctx.error_policy(&restore, error),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled restore: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    fn error_policy(&self, restore: &Restore, error: &OperatorError) -> Action {
        if error.is_transient() {
            debug!(restore = %restore.name_any(), "Restore waiting: {}", error);
            return Action::requeue(self.settings.requeue_interval);
        }
        warn!(restore = %restore.name_any(), "Reconciliation error: {}", error);
        Action::requeue(ERROR_BACKOFF)
    }

    /// Reconcile a Restore
    async fn reconcile(&self, restore: Arc<Restore>) -> std::result::Result<Action, OperatorError> {
        let name = restore.name_any();
        let namespace = restore.namespace().unwrap_or_else(|| "default".to_string());

        info!("Reconciling Restore {}/{}", namespace, name);

        if restore.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&restore, &namespace).await;
        }

        // adding the finalizer bumps the resourceVersion the status write
        // is guarded by, so the pass continues on the patched object
        let restore = self.ensure_finalizer(&restore, &namespace).await?;

        let mut manager = RestoreManager::new(&self.platform, &self.settings, restore.clone());
        let outcome = manager.reconcile(is_workload_ready(&restore)).await;

        // status observed in this pass is kept even when the pass errored
        if manager.restore.status != restore.status {
            self.update_status(&manager.restore, &namespace).await?;
        }

        match outcome? {
            RestoreProgress::InProgress => Ok(Action::requeue(self.settings.requeue_interval)),
            RestoreProgress::AsDataSource => {
                debug!(restore = %name, "Restore serves as a volume data source");
                Ok(Action::await_change())
            }
            RestoreProgress::Completed => {
                let deleted = cleanup_tasks(&self.platform, &self.settings, &restore).await?;
                info!(restore = %name, tasks = deleted, "Restore completed");
                Ok(Action::await_change())
            }
            RestoreProgress::Failed(message) => {
                warn!(restore = %name, "Restore failed: {}", message);
                Ok(Action::await_change())
            }
        }
    }

    /// Ensure the finalizer is present on the resource, returning the
    /// current object
    async fn ensure_finalizer(&self, restore: &Restore, namespace: &str) -> Result<Restore> {
        if restore
            .finalizers()
            .iter()
            .any(|f| f == DATA_PROTECTION_FINALIZER)
        {
            return Ok(restore.clone());
        }

        let restores: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "dataprotection.restore.io/v1alpha1",
            "kind": "Restore",
            "metadata": {
                "finalizers": [DATA_PROTECTION_FINALIZER]
            }
        });
        let patched = restores
            .patch(
                &restore.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        debug!(restore = %restore.name_any(), "Added finalizer");

        Ok(patched)
    }

    /// Handle deletion: delete the restore's tasks, then remove the finalizer
    async fn handle_deletion(
        &self,
        restore: &Restore,
        namespace: &str,
    ) -> std::result::Result<Action, OperatorError> {
        let name = restore.name_any();
        info!("Handling deletion of Restore {}/{}", namespace, name);

        let deleted = cleanup_tasks(&self.platform, &self.settings, restore).await?;
        debug!(restore = %name, tasks = deleted, "Deleted restore tasks");

        let restores: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = restore
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != DATA_PROTECTION_FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        restores
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;

        info!("Finalizer removed for Restore {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    /// Write the status computed by the engine. The resource version guards
    /// against overwriting a status written by a concurrent pass; a conflict
    /// surfaces as a transient error and the restore is requeued.
    async fn update_status(&self, restore: &Restore, namespace: &str) -> Result<()> {
        let restores: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": restore.resource_version()
            },
            "status": restore.status
        });
        restores
            .patch_status(&restore.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }
}
