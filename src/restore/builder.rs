//! Restore task construction
//!
//! Builds the Job and PersistentVolumeClaim objects a restore submits. All
//! output is a pure function of the restore, the backup set being replayed
//! and the task index, so rebuilding a task on a later pass yields the same
//! name and spec and submission stays idempotent.

use super::resolver::BackupActionSet;
use crate::conditions::DATA_PROTECTION_FINALIZER;
use crate::config::RestoreSettings;
use crate::crd::{
    AccessMethod, BackupRepo, ConnectionCredential, Restore, RestoreStage, RestoreVolumeClaim,
    VolumeConfig,
};
use crate::error::{OperatorError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvFromSource, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecretEnvSource, SecretKeySelector, Toleration, TopologySpreadConstraint,
    TypedLocalObjectReference, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

pub const LABEL_RESTORE: &str = "dataprotection.restore.io/restore";
pub const LABEL_RESTORE_NAMESPACE: &str = "dataprotection.restore.io/restore-namespace";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "restore-operator";
/// Populate claim a volume populate task fills
pub const LABEL_POPULATE_PVC: &str = "dataprotection.restore.io/populate-pvc";

pub const ENV_BACKUP_NAME: &str = "DP_BACKUP_NAME";
pub const ENV_BACKUP_BASE_PATH: &str = "DP_BACKUP_BASE_PATH";
pub const ENV_BACKUP_ROOT_PATH: &str = "DP_BACKUP_ROOT_PATH";
pub const ENV_BACKUP_START_TIME: &str = "DP_BACKUP_START_TIME";
pub const ENV_BACKUP_STOP_TIME: &str = "DP_BACKUP_STOP_TIME";
pub const ENV_RESTORE_TIME: &str = "DP_RESTORE_TIME";
pub const ENV_BASE_BACKUP_NAME: &str = "DP_BASE_BACKUP_NAME";
pub const ENV_BASE_BACKUP_BASE_PATH: &str = "DP_BASE_BACKUP_BASE_PATH";
pub const ENV_TIME_ZONE: &str = "DP_TIME_ZONE";
pub const ENV_TARGET_POD_NAME: &str = "DP_TARGET_POD_NAME";
pub const ENV_DB_HOST: &str = "DP_DB_HOST";
pub const ENV_DB_PORT: &str = "DP_DB_PORT";
pub const ENV_DB_USER: &str = "DP_DB_USER";
pub const ENV_DB_PASSWORD: &str = "DP_DB_PASSWORD";

const MAX_NAME_LENGTH: usize = 63;
const NAME_HEAD_LENGTH: usize = 30;
const RESTORE_CONTAINER: &str = "restore";
const BACKUP_REPO_VOLUME: &str = "dp-backup-data";
const BACKUP_REPO_MOUNT_PATH: &str = "/backupdata";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Labels marking every object created for a restore.
pub fn restore_labels(restore: &Restore) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_RESTORE.to_string(), restore.name_any());
    labels.insert(
        LABEL_RESTORE_NAMESPACE.to_string(),
        restore.namespace().unwrap_or_default(),
    );
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

fn owner_reference(restore: &Restore) -> OwnerReference {
    OwnerReference {
        api_version: Restore::api_version(&()).to_string(),
        kind: Restore::kind(&()).to_string(),
        name: restore.name_any(),
        uid: restore.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Keep a name within the object name limit by cutting out its middle.
pub fn cut_task_name(name: String) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= MAX_NAME_LENGTH {
        return name;
    }
    let tail = MAX_NAME_LENGTH - NAME_HEAD_LENGTH;
    chars[..NAME_HEAD_LENGTH]
        .iter()
        .chain(chars[chars.len() - tail..].iter())
        .collect()
}

fn uid_prefix(restore: &Restore) -> String {
    restore
        .metadata
        .uid
        .as_deref()
        .unwrap_or_default()
        .chars()
        .take(8)
        .collect()
}

pub fn prepare_data_task_name(restore: &Restore, backup_name: &str, index: usize) -> String {
    cut_task_name(format!(
        "restore-preparedata-{}-{}-{}",
        uid_prefix(restore),
        backup_name,
        index
    ))
}

pub fn post_ready_task_name(
    restore: &Restore,
    backup_name: &str,
    step: usize,
    index: usize,
) -> String {
    cut_task_name(format!(
        "restore-post-ready-{}-{}-{}-{}",
        uid_prefix(restore),
        backup_name,
        step,
        index
    ))
}

pub fn readiness_probe_task_name(restore: &Restore) -> String {
    cut_task_name(format!("restore-readiness-probe-{}", uid_prefix(restore)))
}

/// Render a time in the backup's offset. An unusable layout falls back to
/// RFC 3339.
pub fn format_backup_time(time: DateTime<Utc>, offset: FixedOffset, layout: &str) -> String {
    let local = time.with_timezone(&offset);
    let items: Vec<Item> = StrftimeItems::new(layout).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return local.to_rfc3339();
    }
    local.format_with_items(items.into_iter()).to_string()
}

/// Replace `$(NAME)` references with literal env values. Unknown names are
/// left untouched.
pub fn expand_env_placeholders(input: &str, env: &[EnvVar]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(')') {
            Some(end) => {
                let name = &after[..end];
                match env
                    .iter()
                    .rev()
                    .find(|e| e.name == name)
                    .and_then(|e| e.value.as_deref())
                {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("$(");
                        out.push_str(name);
                        out.push(')');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Merge `overrides` into `base`; a later entry replaces an earlier one of
/// the same name in place.
pub fn merge_env(base: &mut Vec<EnvVar>, overrides: &[EnvVar]) {
    for env in overrides {
        match base.iter_mut().find(|e| e.name == env.name) {
            Some(existing) => *existing = env.clone(),
            None => base.push(env.clone()),
        }
    }
}

fn literal_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn join_path(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{}", joined)
}

/// Volumes, env and placement specific to one task.
#[derive(Debug, Clone, Default)]
pub struct TaskExtras {
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
    pub env: Vec<EnvVar>,
    pub env_from: Vec<EnvFromSource>,
    /// Extra labels for the task pod template
    pub labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
}

impl TaskExtras {
    pub fn add_volume(&mut self, volume: Volume, mount: VolumeMount) {
        if !self.volumes.iter().any(|v| v.name == volume.name) {
            self.volumes.push(volume);
        }
        self.volume_mounts.push(mount);
    }
}

/// Builds the tasks of one restore stage for one backup set.
pub struct RestoreTaskBuilder<'a> {
    restore: &'a Restore,
    settings: &'a RestoreSettings,
    backup_set: &'a BackupActionSet,
    stage: RestoreStage,
    restore_time: Option<DateTime<Utc>>,
    namespace: String,
    service_account: Option<String>,
    image: String,
    command: Vec<String>,
    env_from: Vec<EnvFromSource>,
    labels: BTreeMap<String, String>,
    volumes: Vec<Volume>,
    volume_mounts: Vec<VolumeMount>,
    tolerations: Vec<Toleration>,
    node_selector: BTreeMap<String, String>,
    node_name: Option<String>,
    affinity: Option<Affinity>,
    topology_spread_constraints: Vec<TopologySpreadConstraint>,
    scheduler_name: Option<String>,
    resources: Option<ResourceRequirements>,
}

impl<'a> RestoreTaskBuilder<'a> {
    pub fn new(
        restore: &'a Restore,
        settings: &'a RestoreSettings,
        backup_set: &'a BackupActionSet,
        stage: RestoreStage,
        restore_time: Option<DateTime<Utc>>,
    ) -> Self {
        let mut builder = Self {
            restore,
            settings,
            backup_set,
            stage,
            restore_time,
            namespace: restore.namespace().unwrap_or_default(),
            service_account: restore.spec.service_account_name.clone(),
            image: String::new(),
            command: Vec::new(),
            env_from: Vec::new(),
            labels: BTreeMap::new(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
            tolerations: Vec::new(),
            node_selector: BTreeMap::new(),
            node_name: None,
            affinity: None,
            topology_spread_constraints: Vec::new(),
            scheduler_name: None,
            resources: None,
        };

        if stage == RestoreStage::PrepareData {
            if let Some(config) = &restore.spec.prepare_data_config {
                let scheduling = &config.scheduling_spec;
                builder.tolerations = scheduling.tolerations.clone();
                builder.node_selector = scheduling.node_selector.clone();
                builder.node_name = scheduling.node_name.clone();
                builder.affinity = scheduling.affinity.clone();
                builder.topology_spread_constraints =
                    scheduling.topology_spread_constraints.clone();
                builder.scheduler_name = scheduling.scheduler_name.clone();
            }
            builder.resources = restore.spec.container_resources.clone();
        }
        builder
    }

    pub fn set_image(&mut self, image: &str, command: &[String]) -> &mut Self {
        self.image = image.to_string();
        self.command = command.to_vec();
        self
    }

    /// Label the task and its pod with `key=value`.
    pub fn add_label(&mut self, key: &str, value: &str) -> &mut Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Run tasks in the operator namespace under the operator's identity.
    pub fn run_in_operator_namespace(&mut self) -> &mut Self {
        self.namespace = self.settings.operator_namespace.clone();
        self.service_account = Some(self.settings.operator_service_account.clone());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Give tasks read access to the repository holding the backup data.
    pub fn attach_backup_repo(&mut self, repo: &BackupRepo) -> Result<&mut Self> {
        match repo.spec.access_method {
            AccessMethod::Mount => {
                let claim_name = repo.backup_pvc_name().ok_or_else(|| {
                    OperatorError::waiting(format!(
                        "backup repo {} has no claim provisioned yet",
                        repo.name_any()
                    ))
                })?;
                self.volumes.push(Volume {
                    name: BACKUP_REPO_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim_name.to_string(),
                        read_only: Some(true),
                    }),
                    ..Default::default()
                });
                self.volume_mounts.push(VolumeMount {
                    name: BACKUP_REPO_VOLUME.to_string(),
                    mount_path: BACKUP_REPO_MOUNT_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
            AccessMethod::Tool => {
                let secret = repo.tool_config_secret_name().ok_or_else(|| {
                    OperatorError::waiting(format!(
                        "backup repo {} has no tool configuration yet",
                        repo.name_any()
                    ))
                })?;
                self.env_from.push(EnvFromSource {
                    secret_ref: Some(SecretEnvSource {
                        name: secret.to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                });
            }
        }
        Ok(self)
    }

    /// Pod the backup data of replica `index` was taken from, when the
    /// backup targeted several pods.
    fn source_pod(&self, index: usize) -> Option<String> {
        let target = self.backup_set.backup.status.as_ref()?.target.as_ref()?;
        if target.selected_target_pods.len() < 2 {
            return None;
        }
        target
            .selected_target_pods
            .get(index % target.selected_target_pods.len())
            .cloned()
    }

    fn source_target_name(&self) -> Option<String> {
        self.restore
            .spec
            .backup
            .source_target_name
            .clone()
            .or_else(|| {
                self.backup_set
                    .backup
                    .status
                    .as_ref()
                    .and_then(|s| s.target.as_ref())
                    .and_then(|t| t.name.clone())
            })
            .filter(|n| !n.is_empty())
    }

    fn base_path(&self, backup_path: &str, index: usize) -> String {
        let target = self.source_target_name().unwrap_or_default();
        let pod = self.source_pod(index).unwrap_or_default();
        join_path(&[backup_path, &target, &pod])
    }

    fn time_layout(&self) -> &str {
        self.backup_set
            .action_set
            .as_ref()
            .map(|a| a.time_format())
            .unwrap_or(crate::crd::DEFAULT_TIME_FORMAT)
    }

    fn time_env(&self, name: &str, time: DateTime<Utc>) -> [EnvVar; 2] {
        let offset = self.backup_set.backup.time_zone();
        [
            literal_env(name, format_backup_time(time, offset, self.time_layout())),
            literal_env(&format!("{}_UNIX", name), time.timestamp().to_string()),
        ]
    }

    /// Env derived from the backup, before action set, method and restore env.
    fn backup_env(&self, index: usize) -> Vec<EnvVar> {
        let backup = &self.backup_set.backup;
        let backup_path = backup
            .status
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_default();

        let mut env = vec![
            literal_env(ENV_BACKUP_NAME, backup.name_any()),
            literal_env(ENV_BACKUP_BASE_PATH, self.base_path(&backup_path, index)),
            literal_env(ENV_TIME_ZONE, backup.time_zone().to_string()),
        ];
        if self.volumes.iter().any(|v| v.name == BACKUP_REPO_VOLUME) {
            env.push(literal_env(ENV_BACKUP_ROOT_PATH, BACKUP_REPO_MOUNT_PATH));
        }
        if let Some(start) = backup.start_time() {
            env.extend(self.time_env(ENV_BACKUP_START_TIME, start));
        }
        if let Some(stop) = backup.stop_time() {
            env.extend(self.time_env(ENV_BACKUP_STOP_TIME, stop));
        }
        if let Some(restore_time) = self.restore_time {
            env.extend(self.time_env(ENV_RESTORE_TIME, restore_time));
        }
        if let Some(base) = &self.backup_set.base_backup {
            let base_path = base
                .status
                .as_ref()
                .and_then(|s| s.path.clone())
                .unwrap_or_default();
            env.push(literal_env(ENV_BASE_BACKUP_NAME, base.name_any()));
            env.push(literal_env(
                ENV_BASE_BACKUP_BASE_PATH,
                self.base_path(&base_path, index),
            ));
        }
        env
    }

    /// Complete env of a task: backup env, then action set, backup method
    /// and restore env, then the task's own extras.
    pub fn task_env(&self, index: usize, extras: &[EnvVar]) -> Vec<EnvVar> {
        let mut env = self.backup_env(index);
        if let Some(action_set) = &self.backup_set.action_set {
            merge_env(&mut env, &action_set.spec.env);
        }
        if let Some(method) = self.backup_set.backup.method() {
            merge_env(&mut env, &method.env);
        }
        merge_env(&mut env, &self.restore.spec.env);
        merge_env(&mut env, extras);
        env
    }

    /// Mount path of a restored claim: explicit, else the path the backed-up
    /// volume was mounted at. Snapshot restores need no mount.
    pub fn resolve_mount_path(&self, config: &VolumeConfig) -> Result<Option<String>> {
        if let Some(path) = config.mount_path.as_deref().filter(|p| !p.is_empty()) {
            return Ok(Some(path.to_string()));
        }
        let source = config.volume_source.as_deref().unwrap_or_default();
        let from_backup = self
            .backup_set
            .backup
            .method()
            .and_then(|m| m.target_volumes.as_ref())
            .and_then(|t| t.volume_mounts.iter().find(|m| m.name == source))
            .map(|m| m.mount_path.clone());

        match from_backup {
            Some(path) => Ok(Some(path)),
            None if self.backup_set.use_volume_snapshot => Ok(None),
            None => Err(OperatorError::fatal(format!(
                "unable to resolve mount path of volume source {:?} for backup {}",
                source,
                self.backup_set.backup_name()
            ))),
        }
    }

    /// Volume and mount of a restored claim inside the task.
    pub fn claim_volume(
        &self,
        config: &VolumeConfig,
        claim_name: &str,
        volume_name: &str,
    ) -> Result<Option<(Volume, VolumeMount)>> {
        let Some(mount_path) = self.resolve_mount_path(config)? else {
            return Ok(None);
        };
        let volume = Volume {
            name: volume_name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: volume_name.to_string(),
            mount_path,
            ..Default::default()
        };
        Ok(Some((volume, mount)))
    }

    /// Claim to create in the restore namespace, optionally populated from
    /// the volume snapshot named `snapshot`.
    pub fn build_pvc(
        &self,
        claim: &RestoreVolumeClaim,
        name: &str,
        snapshot: Option<String>,
    ) -> PersistentVolumeClaim {
        let mut labels = claim.metadata.labels.clone();
        labels.extend(restore_labels(self.restore));

        let mut spec = claim.volume_claim_spec.clone();
        if let Some(snapshot) = snapshot {
            spec.data_source = Some(TypedLocalObjectReference {
                api_group: Some(SNAPSHOT_API_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: snapshot,
            });
        }

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: self.restore.namespace(),
                labels: Some(labels),
                annotations: (!claim.metadata.annotations.is_empty())
                    .then(|| claim.metadata.annotations.clone()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    /// Extras for a task operating against a running target pod: its
    /// connection env, credentials and tolerations and, when requested, its
    /// node and volumes.
    pub fn target_pod_extras(
        &self,
        pod: &Pod,
        credential: Option<&ConnectionCredential>,
        run_on_pod_node: bool,
        volume_mounts: &[VolumeMount],
    ) -> TaskExtras {
        let mut extras = TaskExtras::default();
        let pod_name = pod.name_any();
        let spec = pod.spec.as_ref();
        let first_container = spec.and_then(|s| s.containers.first());

        if let Some(container) = first_container {
            for env in container.env.iter().flatten() {
                if env.value.is_some() || env.value_from.is_some() {
                    extras.env.push(env.clone());
                }
            }
            extras.env_from = container.env_from.clone().unwrap_or_default();
        }
        extras.tolerations = spec.and_then(|s| s.tolerations.clone()).unwrap_or_default();

        extras.env.push(literal_env(ENV_TARGET_POD_NAME, pod_name.clone()));
        let host = match spec.and_then(|s| s.hostname.as_deref().zip(s.subdomain.as_deref())) {
            Some((hostname, subdomain)) => format!(
                "{}.{}.{}.svc",
                hostname,
                subdomain,
                pod.namespace().unwrap_or_default()
            ),
            None => pod
                .status
                .as_ref()
                .and_then(|s| s.pod_ip.clone())
                .unwrap_or_default(),
        };
        if !host.is_empty() {
            extras.env.push(literal_env(ENV_DB_HOST, host));
        }
        if let Some(port) = first_container
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
        {
            extras
                .env
                .push(literal_env(ENV_DB_PORT, port.container_port.to_string()));
        }

        if let Some(credential) = credential {
            let secret = credential.secret_name.as_str();
            let keys = [
                (ENV_DB_USER, &credential.username_key),
                (ENV_DB_PASSWORD, &credential.password_key),
                (ENV_DB_HOST, &credential.host_key),
                (ENV_DB_PORT, &credential.port_key),
            ];
            let mut credential_env = Vec::new();
            for (name, key) in keys {
                if let Some(key) = key.as_deref().filter(|k| !k.is_empty()) {
                    credential_env.push(secret_env(name, secret, key));
                }
            }
            merge_env(&mut extras.env, &credential_env);
        }

        if run_on_pod_node {
            if let Some(node) = spec.and_then(|s| s.node_name.clone()) {
                extras.node_selector.insert(HOSTNAME_LABEL.to_string(), node);
            }

            let pod_volumes = spec.and_then(|s| s.volumes.as_ref());
            for mount in volume_mounts {
                if let Some(volume) = pod_volumes
                    .into_iter()
                    .flatten()
                    .find(|v| v.name == mount.name)
                {
                    extras.add_volume(volume.clone(), mount.clone());
                }
            }
        }
        extras
    }

    /// Build the task named `name` for replica `index`.
    pub fn build(&self, name: &str, index: usize, extras: TaskExtras) -> Job {
        let env = self.task_env(index, &extras.env);
        let image = expand_env_placeholders(&self.image, &env);

        let mut labels = self.labels.clone();
        labels.extend(restore_labels(self.restore));
        labels.insert(
            "dataprotection.restore.io/stage".to_string(),
            self.stage.as_str().to_lowercase(),
        );
        let mut pod_labels = extras.labels;
        pod_labels.extend(labels.clone());

        let mut volumes = self.volumes.clone();
        for volume in extras.volumes {
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume);
            }
        }
        let mut volume_mounts = self.volume_mounts.clone();
        volume_mounts.extend(extras.volume_mounts);

        let mut node_selector = self.node_selector.clone();
        node_selector.extend(extras.node_selector);
        let mut tolerations = self.tolerations.clone();
        tolerations.extend(extras.tolerations);
        let mut env_from = self.env_from.clone();
        env_from.extend(extras.env_from);

        let container = Container {
            name: RESTORE_CONTAINER.to_string(),
            image: Some(image),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            env: Some(env),
            env_from: (!env_from.is_empty()).then_some(env_from),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            resources: self.resources.clone(),
            ..Default::default()
        };

        let owner_references = (self.namespace == self.restore.namespace().unwrap_or_default())
            .then(|| vec![owner_reference(self.restore)]);

        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                finalizers: Some(vec![DATA_PROTECTION_FINALIZER.to_string()]),
                owner_references,
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(self.settings.task_backoff_limit),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![container],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        service_account_name: self.service_account.clone(),
                        tolerations: (!tolerations.is_empty()).then_some(tolerations),
                        node_selector: (!node_selector.is_empty()).then_some(node_selector),
                        node_name: self.node_name.clone(),
                        affinity: self.affinity.clone(),
                        topology_spread_constraints: (!self.topology_spread_constraints.is_empty())
                            .then(|| self.topology_spread_constraints.clone()),
                        scheduler_name: self.scheduler_name.clone(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
