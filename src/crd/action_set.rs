//! ActionSet CRD
//!
//! An ActionSet is a cluster-scoped template describing how a workload kind is
//! backed up and restored. Backups reference it by name; the restore engine
//! reads its `restore` section to build prepare-data and post-ready tasks.

use super::BackupType;
use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Layout used for backup times when no format is declared
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Spec for an ActionSet resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.restore.io",
    version = "v1alpha1",
    kind = "ActionSet",
    printcolumn = r#"{"name":"Backup-Type","type":"string","jsonPath":".spec.backupType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ActionSetSpec {
    /// Type of backup produced by this action set
    #[serde(default)]
    pub backup_type: BackupType,

    /// Environment shared by all backup and restore tasks
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// strftime-style layout for the time variables injected into tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_format: Option<String>,

    /// Restore actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreActionSpec>,
}

/// Restore stages of an action set
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreActionSpec {
    /// Task that restores volume data before the workload starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_data: Option<JobActionSpec>,

    /// Ordered hooks run once the workload is ready
    #[serde(default)]
    pub post_ready: Vec<PostReadyAction>,
}

/// Task definition shared by prepare-data and job-style post-ready actions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobActionSpec {
    /// Container image; may reference task env vars as `$(NAME)`
    pub image: String,

    pub command: Vec<String>,

    /// Schedule the task on the node of the selected target pod
    #[serde(default)]
    pub run_on_target_pod_node: bool,
}

/// Command executed inside a running target pod
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecActionSpec {
    /// Container to exec into; defaults to the pod's first container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    pub command: Vec<String>,
}

/// A post-ready step: exactly one of `job` or `exec`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum PostReadyAction {
    Job(JobActionSpec),
    Exec(ExecActionSpec),
}

impl ActionSet {
    pub fn has_prepare_data_stage(&self) -> bool {
        self.spec
            .restore
            .as_ref()
            .is_some_and(|r| r.prepare_data.is_some())
    }

    pub fn has_post_ready_stage(&self) -> bool {
        self.spec
            .restore
            .as_ref()
            .is_some_and(|r| !r.post_ready.is_empty())
    }

    pub fn prepare_data(&self) -> Option<&JobActionSpec> {
        self.spec.restore.as_ref().and_then(|r| r.prepare_data.as_ref())
    }

    pub fn post_ready(&self) -> &[PostReadyAction] {
        self.spec
            .restore
            .as_ref()
            .map(|r| r.post_ready.as_slice())
            .unwrap_or_default()
    }

    pub fn time_format(&self) -> &str {
        self.spec
            .time_format
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_TIME_FORMAT)
    }
}
