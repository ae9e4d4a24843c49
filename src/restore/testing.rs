//! In-memory cluster and fixtures for restore engine tests

use super::platform::{RestorePlatform, ANN_POPULATED_FROM};
use super::resolver::LABEL_INSTANCE;
use crate::crd::{
    ActionSet, ActionSetSpec, Backup, BackupMethodStatus, BackupPhase, BackupRef, BackupRepo,
    BackupRepoSpec, BackupRepoStatus, BackupSpec, BackupStatus, BackupTarget, BackupTimeRange,
    BackupType, ClaimMetadata, JobActionSpec, PostReadyAction, PrepareDataConfig, Restore,
    RestoreActionSpec, RestoreSpec, RestoreVolumeClaim, RestoreVolumeClaimsTemplate,
    TargetVolumeInfo, VolumeClaimRestorePolicy, VolumeConfig,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimCondition, PersistentVolumeClaimStatus, Pod, PodSpec, PodStatus,
    VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const NAMESPACE: &str = "default";
pub const RESTORE_UID: &str = "0f9e8d7c-1111-2222-3333-444455556666";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Cluster state kept in memory; creation is create-if-absent like the
/// API-backed platform.
#[derive(Default)]
pub struct FakePlatform {
    backups: Mutex<BTreeMap<Key, Backup>>,
    action_sets: Mutex<BTreeMap<String, ActionSet>>,
    backup_repos: Mutex<BTreeMap<String, BackupRepo>>,
    pvcs: Mutex<BTreeMap<Key, PersistentVolumeClaim>>,
    jobs: Mutex<BTreeMap<Key, Job>>,
    pods: Mutex<Vec<Pod>>,
    restores: Mutex<BTreeMap<Key, Restore>>,
    storage_classes: Mutex<BTreeMap<String, StorageClass>>,
    volumes: Mutex<BTreeMap<String, PersistentVolume>>,
    task_creations: AtomicUsize,
    deleted_tasks: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn add_backup(&self, backup: Backup) {
        let ns = backup.namespace().unwrap_or_else(|| NAMESPACE.to_string());
        self.backups
            .lock()
            .unwrap()
            .insert(key(&ns, &backup.name_any()), backup);
    }

    pub fn add_action_set(&self, action_set: ActionSet) {
        self.action_sets
            .lock()
            .unwrap()
            .insert(action_set.name_any(), action_set);
    }

    pub fn add_backup_repo(&self, repo: BackupRepo) {
        self.backup_repos
            .lock()
            .unwrap()
            .insert(repo.name_any(), repo);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn add_restore(&self, restore: Restore) {
        let ns = restore.namespace().unwrap_or_else(|| NAMESPACE.to_string());
        self.restores
            .lock()
            .unwrap()
            .insert(key(&ns, &restore.name_any()), restore);
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let ns = pvc.namespace().unwrap_or_else(|| NAMESPACE.to_string());
        self.pvcs.lock().unwrap().insert(key(&ns, &pvc.name_any()), pvc);
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.pvcs.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Bind a stored claim to `volume`, as the volume controller would.
    pub fn bind_pvc(&self, namespace: &str, name: &str, volume: &str) {
        if let Some(pvc) = self.pvcs.lock().unwrap().get_mut(&key(namespace, name)) {
            pvc.spec.get_or_insert_with(Default::default).volume_name = Some(volume.to_string());
        }
    }

    pub fn add_storage_class(&self, class: StorageClass) {
        self.storage_classes
            .lock()
            .unwrap()
            .insert(class.name_any(), class);
    }

    pub fn add_persistent_volume(&self, volume: PersistentVolume) {
        self.volumes.lock().unwrap().insert(volume.name_any(), volume);
    }

    pub fn persistent_volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().unwrap().get(name).cloned()
    }

    /// Tasks currently stored, ordered by namespace and name.
    pub fn tasks(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks().iter().map(|j| j.name_any()).collect()
    }

    pub fn task(&self, namespace: &str, name: &str) -> Option<Job> {
        self.jobs.lock().unwrap().get(&key(namespace, name)).cloned()
    }

    /// Number of tasks actually created, excluding create calls that found
    /// an existing task.
    pub fn task_creations(&self) -> usize {
        self.task_creations.load(Ordering::SeqCst)
    }

    pub fn deleted_tasks(&self) -> Vec<String> {
        self.deleted_tasks.lock().unwrap().clone()
    }

    pub fn pvcs(&self) -> Vec<PersistentVolumeClaim> {
        self.pvcs.lock().unwrap().values().cloned().collect()
    }

    fn set_condition(&self, namespace: &str, name: &str, type_: &str, message: Option<&str>) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&key(namespace, name)) {
            job.status = Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    message: message.map(String::from),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub fn complete_task(&self, namespace: &str, name: &str) {
        self.set_condition(namespace, name, "Complete", None);
    }

    pub fn fail_task(&self, namespace: &str, name: &str, message: &str) {
        self.set_condition(namespace, name, "Failed", Some(message));
    }

    pub fn complete_all_tasks(&self) {
        for job in self.tasks() {
            let ns = job.namespace().unwrap_or_default();
            self.complete_task(&ns, &job.name_any());
        }
    }
}

#[async_trait]
impl RestorePlatform for FakePlatform {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>> {
        Ok(self.backups.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn list_backups(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Backup>> {
        Ok(self
            .backups
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, b)| labels.iter().all(|(k, v)| b.labels().get(k) == Some(v)))
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn get_action_set(&self, name: &str) -> Result<Option<ActionSet>> {
        Ok(self.action_sets.lock().unwrap().get(name).cloned())
    }

    async fn get_backup_repo(&self, name: &str) -> Result<Option<BackupRepo>> {
        Ok(self.backup_repos.lock().unwrap().get(name).cloned())
    }

    async fn create_pvc_if_absent(&self, pvc: &PersistentVolumeClaim) -> Result<bool> {
        let k = key(&pvc.namespace().unwrap_or_default(), &pvc.name_any());
        let mut pvcs = self.pvcs.lock().unwrap();
        if pvcs.contains_key(&k) {
            return Ok(false);
        }
        pvcs.insert(k, pvc.clone());
        Ok(true)
    }

    async fn get_task(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.task(namespace, name))
    }

    async fn create_task_if_absent(&self, job: &Job) -> Result<Job> {
        let k = key(&job.namespace().unwrap_or_default(), &job.name_any());
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.get(&k) {
            return Ok(existing.clone());
        }
        self.task_creations.fetch_add(1, Ordering::SeqCst);
        jobs.insert(k, job.clone());
        Ok(job.clone())
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> Result<()> {
        if self
            .jobs
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .is_some()
        {
            self.deleted_tasks.lock().unwrap().push(name.to_string());
        }
        Ok(())
    }

    async fn delete_tasks(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<usize> {
        let names: Vec<String> = self
            .tasks()
            .into_iter()
            .filter(|j| j.namespace().as_deref() == Some(namespace))
            .filter(|j| labels.iter().all(|(k, v)| j.labels().get(k) == Some(v)))
            .map(|j| j.name_any())
            .collect();
        for name in &names {
            self.delete_task(namespace, name).await?;
        }
        Ok(names.len())
    }

    async fn remove_task_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&key(namespace, name)) {
            job.metadata.finalizers = None;
        }
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .filter(|p| selector_matches(selector, p.labels()))
            .cloned()
            .collect())
    }

    async fn get_restore(&self, namespace: &str, name: &str) -> Result<Option<Restore>> {
        Ok(self.restores.lock().unwrap().get(&key(namespace, name)).cloned())
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(namespace, name))
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        self.pvcs.lock().unwrap().remove(&key(namespace, name));
        Ok(())
    }

    async fn set_pvc_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: &[String],
    ) -> Result<()> {
        if let Some(pvc) = self.pvcs.lock().unwrap().get_mut(&key(namespace, name)) {
            pvc.metadata.finalizers = Some(finalizers.to_vec());
        }
        Ok(())
    }

    async fn set_pvc_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[PersistentVolumeClaimCondition],
    ) -> Result<()> {
        if let Some(pvc) = self.pvcs.lock().unwrap().get_mut(&key(namespace, name)) {
            pvc.status
                .get_or_insert_with(PersistentVolumeClaimStatus::default)
                .conditions = Some(conditions.to_vec());
        }
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.storage_classes.lock().unwrap().get(name).cloned())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.persistent_volume(name))
    }

    async fn rebind_persistent_volume(
        &self,
        name: &str,
        claim: &ObjectReference,
        populated_from: &str,
    ) -> Result<()> {
        if let Some(volume) = self.volumes.lock().unwrap().get_mut(name) {
            volume.spec.get_or_insert_with(Default::default).claim_ref = Some(claim.clone());
            volume
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANN_POPULATED_FROM.to_string(), populated_from.to_string());
        }
        Ok(())
    }
}

/// Evaluate a label selector against a label set, as the API server does
/// for list calls.
fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));

    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v)),
            "NotIn" => labels.get(&expr.key).map_or(true, |v| !values.contains(v)),
            "Exists" => labels.contains_key(&expr.key),
            "DoesNotExist" => !labels.contains_key(&expr.key),
            _ => false,
        }
    });

    labels_match && expressions_match
}

fn workload_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_INSTANCE.to_string(), "mysql".to_string())])
}

fn backup(
    name: &str,
    backup_type: BackupType,
    method: &str,
    action_set: Option<&str>,
    stop: DateTime<Utc>,
) -> Backup {
    let mut backup = Backup::new(
        name,
        BackupSpec {
            backup_policy_name: "mysql-policy".to_string(),
            backup_method: method.to_string(),
            parent_backup_name: None,
        },
    );
    backup.metadata.namespace = Some(NAMESPACE.to_string());
    backup.metadata.labels = Some(workload_labels());
    backup.status = Some(BackupStatus {
        phase: BackupPhase::Completed,
        backup_type,
        start_timestamp: Some(stop - Duration::minutes(10)),
        completion_timestamp: Some(stop),
        time_range: None,
        backup_repo_name: Some("repo".to_string()),
        path: Some(format!("/mysql/{}", name)),
        target: Some(BackupTarget {
            name: None,
            pod_selector: Default::default(),
            selected_target_pods: vec!["mysql-0".to_string()],
        }),
        backup_method: Some(BackupMethodStatus {
            name: method.to_string(),
            action_set_name: action_set.map(String::from),
            snapshot_volumes: Some(false),
            compatible_method: None,
            target_volumes: Some(TargetVolumeInfo {
                volumes: vec!["data".to_string()],
                volume_mounts: vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/var/lib/mysql".to_string(),
                    ..Default::default()
                }],
            }),
            env: vec![EnvVar {
                name: "METHOD_ENV".to_string(),
                value: Some("from-method".to_string()),
                ..Default::default()
            }],
        }),
    });
    backup
}

pub fn full_backup(name: &str, stop: DateTime<Utc>) -> Backup {
    backup(name, BackupType::Full, "xtrabackup", Some("xtrabackup"), stop)
}

pub fn incremental_backup(name: &str, parent: &str, stop: DateTime<Utc>) -> Backup {
    let mut backup = backup(
        name,
        BackupType::Incremental,
        "xtrabackup-inc",
        Some("xtrabackup-inc"),
        stop,
    );
    backup.spec.parent_backup_name = Some(parent.to_string());
    if let Some(method) = backup.status.as_mut().and_then(|s| s.backup_method.as_mut()) {
        method.compatible_method = Some("xtrabackup".to_string());
    }
    backup
}

pub fn continuous_backup(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Backup {
    let mut backup = backup(name, BackupType::Continuous, "binlog", Some("binlog"), end);
    if let Some(status) = backup.status.as_mut() {
        status.phase = BackupPhase::Running;
        status.completion_timestamp = None;
        status.time_range = Some(BackupTimeRange {
            time_zone: Some("+08:00".to_string()),
            start: Some(start),
            end: Some(end),
        });
    }
    backup
}

pub fn snapshot_backup(name: &str, stop: DateTime<Utc>) -> Backup {
    let mut backup = backup(name, BackupType::Full, "volume-snapshot", None, stop);
    if let Some(method) = backup.status.as_mut().and_then(|s| s.backup_method.as_mut()) {
        method.snapshot_volumes = Some(true);
    }
    backup
}

/// Action set with an optional prepare-data task and a single job-style
/// post-ready step.
pub fn action_set(name: &str, prepare_data: bool, post_ready: bool) -> ActionSet {
    ActionSet::new(
        name,
        ActionSetSpec {
            backup_type: BackupType::Full,
            env: vec![EnvVar {
                name: "IMAGE_TAG".to_string(),
                value: Some("8.0".to_string()),
                ..Default::default()
            }],
            time_format: None,
            restore: Some(RestoreActionSpec {
                prepare_data: prepare_data.then(|| JobActionSpec {
                    image: "restore:$(IMAGE_TAG)".to_string(),
                    command: vec!["sh".to_string(), "-c".to_string(), "restore.sh".to_string()],
                    run_on_target_pod_node: false,
                }),
                post_ready: if post_ready {
                    vec![PostReadyAction::Job(JobActionSpec {
                        image: "tools:1.0".to_string(),
                        command: vec!["apply-log".to_string()],
                        run_on_target_pod_node: true,
                    })]
                } else {
                    Vec::new()
                },
            }),
        },
    )
}

pub fn backup_repo(name: &str) -> BackupRepo {
    let mut repo = BackupRepo::new(
        name,
        BackupRepoSpec {
            storage_provider_ref: "s3".to_string(),
            ..Default::default()
        },
    );
    repo.status = Some(BackupRepoStatus {
        backup_pvc_name: Some("dp-backup-repo".to_string()),
        tool_config_secret_name: None,
    });
    repo
}

pub fn restore(name: &str, backup_name: &str) -> Restore {
    let mut restore = Restore::new(
        name,
        RestoreSpec {
            backup: BackupRef {
                name: backup_name.to_string(),
                namespace: NAMESPACE.to_string(),
                source_target_name: None,
            },
            ..Default::default()
        },
    );
    restore.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(RESTORE_UID.to_string()),
        generation: Some(1),
        ..Default::default()
    };
    restore
}

/// Prepare-data config restoring `data-mysql-<i>` claims from the `data` volume.
pub fn template_config(replicas: i32, policy: VolumeClaimRestorePolicy) -> PrepareDataConfig {
    PrepareDataConfig {
        volume_claims: Vec::new(),
        volume_claims_template: Some(RestoreVolumeClaimsTemplate {
            templates: vec![RestoreVolumeClaim {
                metadata: ClaimMetadata {
                    name: "data-mysql".to_string(),
                    ..Default::default()
                },
                volume_claim_spec: Default::default(),
                volume_config: VolumeConfig {
                    volume_source: Some("data".to_string()),
                    mount_path: None,
                },
            }],
            replicas,
            starting_index: 0,
        }),
        volume_claim_restore_policy: policy,
        scheduling_spec: Default::default(),
        data_source_ref: None,
    }
}

pub fn pod(name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(workload_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "mysql".to_string(),
                image: Some("mysql:8.0".to_string()),
                env: Some(vec![EnvVar {
                    name: "MYSQL_PORT".to_string(),
                    value: Some("3306".to_string()),
                    ..Default::default()
                }]),
                ports: Some(vec![ContainerPort {
                    container_port: 3306,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        }),
    }
}

pub fn workload_selector() -> LabelSelector {
    LabelSelector {
        match_labels: Some(workload_labels()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    #[test]
    fn test_selector_matches() {
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

        let mut labels = BTreeMap::from([
            ("app".to_string(), "mysql".to_string()),
            ("role".to_string(), "primary".to_string()),
        ]);
        assert!(selector_matches(&selector, &labels));

        labels.insert("paused".to_string(), "true".to_string());
        assert!(!selector_matches(&selector, &labels));

        assert!(selector_matches(&LabelSelector::default(), &BTreeMap::new()));
    }
}
