//! Backup CRD
//!
//! A Backup records a completed (or, for continuous backups, still running)
//! data-protection operation. The restore engine only ever reads Backups; they
//! are produced by the backup subsystem.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use k8s_openapi::api::core::v1::{EnvVar, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec for a Backup resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.restore.io",
    version = "v1alpha1",
    kind = "Backup",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.backupPolicyName"}"#,
    printcolumn = r#"{"name":"Method","type":"string","jsonPath":".spec.backupMethod"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".status.backupType"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Backup policy this backup was taken with
    pub backup_policy_name: String,

    /// Backup method name within the policy
    pub backup_method: String,

    /// Parent backup, set for incremental and differential backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_backup_name: Option<String>,
}

/// Type of backup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum BackupType {
    /// Self-contained copy of the data
    #[default]
    Full,
    /// Changes since the previous full or incremental backup
    Incremental,
    /// Changes since the parent full backup
    Differential,
    /// Continuously shipped logs enabling point-in-time recovery
    Continuous,
    /// Full backup of a subset of the data
    Selective,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Full"),
            Self::Incremental => write!(f, "Incremental"),
            Self::Differential => write!(f, "Differential"),
            Self::Continuous => write!(f, "Continuous"),
            Self::Selective => write!(f, "Selective"),
        }
    }
}

/// Phase of a backup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum BackupPhase {
    #[default]
    New,
    Running,
    Completed,
    Failed,
    Deleting,
}

/// Status of a Backup resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    /// Backup type resolved from the action set at backup time
    #[serde(default)]
    pub backup_type: BackupType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    /// Time range covered by the backup data; overrides the timestamps above
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<BackupTimeRange>,

    /// Repository holding the backup data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_name: Option<String>,

    /// Path of the backup data inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Pods the backup was taken from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<BackupTarget>,

    /// Snapshot of the backup method used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_method: Option<BackupMethodStatus>,
}

/// Time range of the data contained in a backup
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupTimeRange {
    /// UTC offset such as `+08:00`; empty means UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Pod selection strategy of a backup or restore target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum PodSelectionStrategy {
    /// A single pod among the matching ones
    #[default]
    Any,
    /// Every matching pod
    All,
}

/// Label selector plus selection strategy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    #[serde(flatten)]
    pub label_selector: LabelSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<PodSelectionStrategy>,
}

/// Pods selected by the original backup
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupTarget {
    /// Name of the source target, used to isolate data paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub pod_selector: PodSelector,

    /// Pods actually backed up, in backup order
    #[serde(default)]
    pub selected_target_pods: Vec<String>,
}

/// Volumes the backup method read from
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetVolumeInfo {
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

/// Resolved backup method recorded on the backup status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMethodStatus {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_set_name: Option<String>,

    /// Whether the method took volume snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,

    /// Full-backup method whose output this method can be applied on top of
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatible_method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_volumes: Option<TargetVolumeInfo>,

    #[serde(default)]
    pub env: Vec<EnvVar>,
}

impl Backup {
    fn status_ref(&self) -> Option<&BackupStatus> {
        self.status.as_ref()
    }

    pub fn phase(&self) -> BackupPhase {
        self.status_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn backup_type(&self) -> BackupType {
        self.status_ref().map(|s| s.backup_type).unwrap_or_default()
    }

    pub fn method(&self) -> Option<&BackupMethodStatus> {
        self.status_ref().and_then(|s| s.backup_method.as_ref())
    }

    pub fn uses_volume_snapshot(&self) -> bool {
        self.method()
            .and_then(|m| m.snapshot_volumes)
            .unwrap_or(false)
    }

    /// Stop time of the backup: the recorded time range end if any, else completion.
    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        let status = self.status_ref()?;
        status
            .time_range
            .as_ref()
            .and_then(|r| r.end)
            .or(status.completion_timestamp)
    }

    /// Start time of the backup: the recorded time range start if any, else start.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let status = self.status_ref()?;
        status
            .time_range
            .as_ref()
            .and_then(|r| r.start)
            .or(status.start_timestamp)
    }

    /// Offset the backup's times should be rendered in.
    pub fn time_zone(&self) -> FixedOffset {
        self.status_ref()
            .and_then(|s| s.time_range.as_ref())
            .and_then(|r| r.time_zone.as_deref())
            .and_then(parse_time_zone)
            .unwrap_or_else(utc_offset)
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Parse a UTC offset such as `+08:00`, `-0530`, `Z` or `UTC`.
pub fn parse_time_zone(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(utc_offset());
    }
    raw.parse::<FixedOffset>().ok()
}
