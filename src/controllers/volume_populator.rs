//! Volume Populator Controller
//!
//! Reconciles PersistentVolumeClaims whose `dataSourceRef` names a Restore.
//! Claims referencing anything else are ignored; populate tasks are owned
//! by their claim so task changes wake the claim up again.

use crate::config::RestoreSettings;
use crate::error::{OperatorError, Result};
use crate::restore::builder::LABEL_POPULATE_PVC;
use crate::restore::{KubePlatform, PopulateProgress, VolumePopulator};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Next step of the controller after a populator pass.
pub fn populate_action(progress: &PopulateProgress, requeue_interval: Duration) -> Action {
    match progress {
        PopulateProgress::InProgress => Action::requeue(requeue_interval),
        PopulateProgress::Skipped
        | PopulateProgress::WaitingForNode
        | PopulateProgress::Populated
        | PopulateProgress::CleanedUp
        | PopulateProgress::Failed(_) => Action::await_change(),
    }
}

/// Context for the volume populator controller
pub struct VolumePopulatorController {
    client: Client,
    platform: KubePlatform,
    settings: RestoreSettings,
    namespace: Option<String>,
}

impl VolumePopulatorController {
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

    /// Run the volume populator controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = self.api();
        let jobs: Api<Job> = self.api();

        info!("Starting Volume Populator controller");

        Controller::new(pvcs, Config::default())
            .owns(jobs, Config::default().labels(LABEL_POPULATE_PVC))
            .shutdown_on_signal()
            .run(
                |pvc, ctx| async move { ctx.reconcile(pvc).await },
                |pvc, error, ctx| ctx.error_policy(&pvc, error),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled PVC: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Volume populate reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    fn error_policy(&self, pvc: &PersistentVolumeClaim, error: &OperatorError) -> Action {
        if error.is_transient() {
            debug!(pvc = %pvc.name_any(), "Volume populate waiting: {}", error);
            return Action::requeue(self.settings.requeue_interval);
        }
        warn!(pvc = %pvc.name_any(), "Volume populate error: {}", error);
        Action::requeue(ERROR_BACKOFF)
    }

    async fn reconcile(
        &self,
        pvc: Arc<PersistentVolumeClaim>,
    ) -> std::result::Result<Action, OperatorError> {
        let progress = VolumePopulator::new(&self.platform, &self.settings)
            .reconcile(&pvc)
            .await?;
        if progress != PopulateProgress::Skipped {
            debug!(
                "PVC {}/{}: {:?}",
                pvc.namespace().unwrap_or_default(),
                pvc.name_any(),
                progress
            );
        }
        Ok(populate_action(&progress, self.settings.requeue_interval))
    }
}
