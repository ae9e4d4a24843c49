//! Cluster capabilities the restore engine depends on
//!
//! Every read and write the engine performs goes through [`RestorePlatform`],
//! so the orchestration logic can run against the API server in production
//! and against an in-memory fake in tests.

use crate::conditions::DATA_PROTECTION_FINALIZER;
use crate::crd::{ActionSet, Backup, BackupRepo, Restore};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimCondition, Pod,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Annotation on a rebound volume naming the restore that populated it.
pub const ANN_POPULATED_FROM: &str = "dataprotection.restore.io/populate-from";

/// Observed phase of a restore task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    Running,
    Completed,
    Failed(String),
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Derive a task's phase from its Job conditions and counters.
pub fn task_phase(job: &Job) -> TaskPhase {
    let Some(status) = job.status.as_ref() else {
        return TaskPhase::Pending;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return TaskPhase::Completed,
            "Failed" => {
                let message = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "task failed".to_string());
                return TaskPhase::Failed(message);
            }
            _ => {}
        }
    }

    if status.active.unwrap_or(0) > 0 {
        TaskPhase::Running
    } else {
        TaskPhase::Pending
    }
}

/// Stable reference of a task: `Job/<namespace>/<name>`.
pub fn task_object_key(namespace: &str, name: &str) -> String {
    format!("Job/{}/{}", namespace, name)
}

/// Render a label selector in the API server's query syntax.
pub fn selector_to_query(selector: &LabelSelector) -> String {
    let mut terms: Vec<String> = Vec::new();
    for (key, value) in selector.match_labels.iter().flatten() {
        terms.push(format!("{}={}", key, value));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default().join(",");
        match expr.operator.as_str() {
            "In" => terms.push(format!("{} in ({})", expr.key, values)),
            "NotIn" => terms.push(format!("{} notin ({})", expr.key, values)),
            "Exists" => terms.push(expr.key.clone()),
            "DoesNotExist" => terms.push(format!("!{}", expr.key)),
            _ => {}
        }
    }
    terms.join(",")
}

/// Render a label map in the API server's query syntax.
pub fn labels_to_query(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Reads and writes the restore engine performs against the cluster.
///
/// Lookups return `Ok(None)` when the object does not exist; creation is
/// always create-if-absent so repeated reconciliation passes are harmless.
#[async_trait]
pub trait RestorePlatform: Send + Sync {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>>;

    async fn list_backups(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Backup>>;

    async fn get_action_set(&self, name: &str) -> Result<Option<ActionSet>>;

    async fn get_backup_repo(&self, name: &str) -> Result<Option<BackupRepo>>;

    /// Create the claim unless one with the same name exists. Returns
    /// whether a new claim was created.
    async fn create_pvc_if_absent(&self, pvc: &PersistentVolumeClaim) -> Result<bool>;

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create the task unless it exists; returns the task as stored.
    async fn create_task_if_absent(&self, job: &Job) -> Result<Job>;

    /// Delete a task. Deleting a missing task succeeds.
    async fn delete_task(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete every task carrying the given labels; returns how many were deleted.
    async fn delete_tasks(&self, namespace: &str, labels: &BTreeMap<String, String>)
        -> Result<usize>;

    async fn remove_task_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>>;

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>>;

    async fn get_pvc(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Delete a claim. Deleting a missing claim succeeds.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// Replace the finalizers of a claim.
    async fn set_pvc_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()>;

    /// Replace the status conditions of a claim.
    async fn set_pvc_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[PersistentVolumeClaimCondition],
    ) -> Result<()>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Point a volume's claim reference at `claim` and record the restore
    /// it was populated from.
    async fn rebind_persistent_volume(
        &self,
        name: &str,
        claim: &ObjectReference,
        populated_from: &str,
    ) -> Result<()>;
}

/// [`RestorePlatform`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a lookup result so that a missing object becomes `None`.
fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl RestorePlatform for KubePlatform {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn list_backups(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Backup>> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&labels_to_query(labels));
        Ok(api.list(&params).await?.items)
    }

    async fn get_action_set(&self, name: &str) -> Result<Option<ActionSet>> {
        let api: Api<ActionSet> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn get_backup_repo(&self, name: &str) -> Result<Option<BackupRepo>> {
        let api: Api<BackupRepo> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn create_pvc_if_absent(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let namespace = pvc.namespace().unwrap_or_default();
        let name = pvc.name_any();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);

        if optional(api.get(&name).await)?.is_some() {
            debug!("PVC {}/{} already exists", namespace, name);
            return Ok(false);
        }

        match api.create(&PostParams::default(), pvc).await {
            Ok(_) => {
                info!("Created PVC {}/{}", namespace, name);
                Ok(true)
            }
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        optional(self.jobs(namespace).get(name).await)
    }

    async fn create_task_if_absent(&self, job: &Job) -> Result<Job> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let api = self.jobs(&namespace);

        if let Some(existing) = optional(api.get(&name).await)? {
            return Ok(existing);
        }

        match api.create(&PostParams::default(), job).await {
            Ok(created) => {
                info!("Created restore task {}/{}", namespace, name);
                Ok(created)
            }
            Err(e) if is_conflict(&e) => Ok(api.get(&name).await?),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!("Deleted restore task {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_tasks(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let api = self.jobs(namespace);
        let params = ListParams::default().labels(&labels_to_query(labels));
        let jobs = api.list(&params).await?.items;

        let mut deleted = 0;
        for job in &jobs {
            let name = job.name_any();
            if job.finalizers().iter().any(|f| f == DATA_PROTECTION_FINALIZER) {
                self.remove_task_finalizer(namespace, &name).await?;
            }
            self.delete_task(namespace, &name).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn remove_task_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api = self.jobs(namespace);
        let Some(job) = optional(api.get(name).await)? else {
            return Ok(());
        };

        let finalizers: Vec<String> = job
            .finalizers()
            .iter()
            .filter(|f| *f != DATA_PROTECTION_FINALIZER)
            .cloned()
            .collect();
        if finalizers.len() == job.finalizers().len() {
            return Ok(());
        }

        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        debug!("Removed finalizer from restore task {}/{}", namespace, name);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_to_query(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        optional(self.pvcs(namespace).get(name).await)
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pvcs(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                info!("Deleted PVC {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_pvc_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.pvcs(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Updated finalizers of PVC {}/{}", namespace, name);
        Ok(())
    }

    async fn set_pvc_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[PersistentVolumeClaimCondition],
    ) -> Result<()> {
        let patch = json!({
            "status": {
                "conditions": conditions
            }
        });
        self.pvcs(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn rebind_persistent_volume(
        &self,
        name: &str,
        claim: &ObjectReference,
        populated_from: &str,
    ) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "annotations": {
                    ANN_POPULATED_FROM: populated_from
                }
            },
            "spec": {
                "claimRef": claim
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(
            "Rebound PV {} to PVC {}/{}",
            name,
            claim.namespace.as_deref().unwrap_or_default(),
            claim.name.as_deref().unwrap_or_default()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn job_with_condition(type_: &str, message: Option<&str>) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    message: message.map(String::from),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_task_phase() {
        assert_eq!(task_phase(&Job::default()), TaskPhase::Pending);
        assert_eq!(task_phase(&job_with_condition("Complete", None)), TaskPhase::Completed);
        assert_eq!(
            task_phase(&job_with_condition("Failed", Some("BackoffLimitExceeded"))),
            TaskPhase::Failed("BackoffLimitExceeded".to_string())
        );

        let running = Job {
            status: Some(JobStatus {
                active: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(task_phase(&running), TaskPhase::Running);
        assert!(!task_phase(&running).is_terminal());
    }

    #[test]
    fn test_object_key() {
        assert_eq!(
            task_object_key("default", "restore-preparedata-0"),
            "Job/default/restore-preparedata-0"
        );
    }

    #[test]
    fn test_selector_to_query() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "mysql".to_string())])),
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "role".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["primary".to_string(), "secondary".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "paused".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };

        assert_eq!(
            selector_to_query(&selector),
            "app=mysql,role in (primary,secondary),!paused"
        );
        assert_eq!(selector_to_query(&LabelSelector::default()), "");
    }
}
