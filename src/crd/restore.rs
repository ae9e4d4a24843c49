//! Restore CRD
//!
//! The user-facing restore intent. The spec names a backup and how its data
//! should be replayed; the status is the single source of truth for restore
//! progress, holding one action record per task the operator submitted.

use super::PodSelector;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PersistentVolumeClaimSpec, ResourceRequirements, Toleration,
    TopologySpreadConstraint, VolumeMount,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spec for a Restore resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.restore.io",
    version = "v1alpha1",
    kind = "Restore",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backup.name"}"#,
    printcolumn = r#"{"name":"Restore-Time","type":"string","jsonPath":".spec.restoreTime"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Duration","type":"string","jsonPath":".status.duration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Backup to restore
    pub backup: BackupRef,

    /// Point in time to restore to (RFC 3339), required for continuous backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<String>,

    /// Volumes to restore and how the restore tasks are scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_data_config: Option<PrepareDataConfig>,

    /// Service account for prepare-data tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Post-ready configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_config: Option<ReadyConfig>,

    /// Extra env for restore tasks; overrides backup and action set env
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Resources of the restore task container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_resources: Option<ResourceRequirements>,
}

/// Reference to the backup being restored
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRef {
    pub name: String,

    pub namespace: String,

    /// Restrict data paths to one source target of the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_target_name: Option<String>,
}

/// Volume restore policy for sibling prepare-data tasks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VolumeClaimRestorePolicy {
    /// All replicas restore concurrently
    #[default]
    Parallel,
    /// One replica at a time; later tasks wait for the previous to complete
    Serial,
}

/// Prepare-data configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrepareDataConfig {
    /// Claims mounted together into every restore task
    #[serde(default)]
    pub volume_claims: Vec<RestoreVolumeClaim>,

    /// Template of per-replica claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claims_template: Option<RestoreVolumeClaimsTemplate>,

    #[serde(default)]
    pub volume_claim_restore_policy: VolumeClaimRestorePolicy,

    #[serde(default)]
    pub scheduling_spec: SchedulingSpec,

    /// Makes the restore a data source for claims whose `dataSourceRef`
    /// names it; those claims are filled by the volume populator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_ref: Option<VolumeConfig>,
}

impl PrepareDataConfig {
    pub fn is_serial_policy(&self) -> bool {
        self.volume_claim_restore_policy == VolumeClaimRestorePolicy::Serial
    }

    /// Number of prepare-data tasks expected per backup: the template
    /// replicas, or a single task when only explicit claims are declared.
    pub fn expected_replicas(&self) -> usize {
        match &self.volume_claims_template {
            Some(template) => template.replicas.max(0) as usize,
            None => 1,
        }
    }

    pub fn has_claims(&self) -> bool {
        !self.volume_claims.is_empty() || self.volume_claims_template.is_some()
    }
}

/// Metadata applied to a restored claim
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMetadata {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Source volume and mount path of a restored claim
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    /// Volume of the backup's target volumes this claim is restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_source: Option<String>,

    /// Mount path inside the restore task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

/// A claim to create (if absent) and restore into
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVolumeClaim {
    pub metadata: ClaimMetadata,

    pub volume_claim_spec: PersistentVolumeClaimSpec,

    #[serde(flatten)]
    pub volume_config: VolumeConfig,
}

/// Per-replica claim templates, named `<template>-<index>`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreVolumeClaimsTemplate {
    pub templates: Vec<RestoreVolumeClaim>,

    pub replicas: i32,

    #[serde(default)]
    pub starting_index: i32,
}

/// Scheduling constraints for restore tasks
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSpec {
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default)]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_name: Option<String>,
}

/// Post-ready configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_action: Option<JobAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_action: Option<ExecAction>,

    /// Secret keys exposing connection details to post-ready tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_credential: Option<ConnectionCredential>,

    /// Probe that must succeed before post-ready tasks run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ReadinessProbe>,
}

/// Target of job-style post-ready actions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobAction {
    pub target: JobActionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobActionTarget {
    /// Pods to run against; strategy defaults to `Any`
    pub pod_selector: PodSelector,

    /// Volumes of the selected pod mounted into the task
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Target of exec-style post-ready actions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecAction {
    pub target: ExecActionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecActionTarget {
    /// Pods to exec into; strategy defaults to `All`
    pub pod_selector: PodSelector,
}

/// Secret-sourced connection details
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCredential {
    pub secret_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_key: Option<String>,
}

/// Readiness probe run as a task
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbe {
    #[serde(default)]
    pub initial_delay_seconds: i32,

    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: i32,

    #[serde(default = "default_probe_period")]
    pub period_seconds: i32,

    pub exec: ReadinessProbeExec,
}

fn default_probe_timeout() -> i32 {
    30
}
fn default_probe_period() -> i32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbeExec {
    pub image: String,
    pub command: Vec<String>,
}

/// Restore stage an action belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RestoreStage {
    PrepareData,
    PostReady,
}

impl RestoreStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrepareData => "prepareData",
            Self::PostReady => "postReady",
        }
    }

    /// Name of the action record for a given step of this stage.
    pub fn action_name(&self, step: usize) -> String {
        format!("{}-{}", self.as_str(), step)
    }
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a restore
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RestorePhase {
    /// Spec and backup lineage not yet validated
    #[default]
    ValidationPending,
    /// Restoring volume data
    PrepareData,
    /// Waiting for the target workload to become ready
    ReadinessWait,
    /// Running post-ready hooks
    PostReady,
    /// Serves as the data source of populated claims
    AsDataSource,
    Completed,
    Failed,
}

impl RestorePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationPending => write!(f, "ValidationPending"),
            Self::PrepareData => write!(f, "PrepareData"),
            Self::ReadinessWait => write!(f, "ReadinessWait"),
            Self::PostReady => write!(f, "PostReady"),
            Self::AsDataSource => write!(f, "AsDataSource"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a single restore action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RestoreActionStatus {
    #[default]
    Processing,
    Completed,
    Failed,
}

impl RestoreActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Record of one task submitted for a backup and action
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatusAction {
    /// Action name, `<stage>-<step>`
    pub name: String,

    pub backup_name: String,

    /// Stable reference of the task, `Job/<namespace>/<name>`
    pub object_key: String,

    #[serde(default)]
    pub status: RestoreActionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Action records per stage
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatusActions {
    #[serde(default)]
    pub prepare_data: Vec<RestoreStatusAction>,

    #[serde(default)]
    pub post_ready: Vec<RestoreStatusAction>,
}

impl RestoreStatusActions {
    pub fn stage(&self, stage: RestoreStage) -> &Vec<RestoreStatusAction> {
        match stage {
            RestoreStage::PrepareData => &self.prepare_data,
            RestoreStage::PostReady => &self.post_ready,
        }
    }

    pub fn stage_mut(&mut self, stage: RestoreStage) -> &mut Vec<RestoreStatusAction> {
        match stage {
            RestoreStage::PrepareData => &mut self.prepare_data,
            RestoreStage::PostReady => &mut self.post_ready,
        }
    }
}

/// Condition for restore status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Status of a Restore resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(default)]
    pub phase: RestorePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// Wall-clock duration, e.g. `1h2m3s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(default)]
    pub actions: RestoreStatusActions,

    #[serde(default)]
    pub conditions: Vec<RestoreCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
