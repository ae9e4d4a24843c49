//! BackupRepo CRD
//!
//! Cluster-scoped description of where backup data lives. Restore tasks are
//! given read access to the repository of the backup they replay.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spec for a BackupRepo resource
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "dataprotection.restore.io",
    version = "v1alpha1",
    kind = "BackupRepo",
    status = "BackupRepoStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.storageProviderRef"}"#,
    printcolumn = r#"{"name":"Access","type":"string","jsonPath":".spec.accessMethod"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupRepoSpec {
    /// Storage provider backing the repository
    pub storage_provider_ref: String,

    /// How tasks reach the repository
    #[serde(default)]
    pub access_method: AccessMethod,

    /// Provider-specific settings
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Repository access method
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum AccessMethod {
    /// Repository is exposed as a persistent volume claim in each namespace
    #[default]
    Mount,
    /// Repository is reached by a tool configured through a secret
    Tool,
}

/// Status of a BackupRepo resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupRepoStatus {
    /// Claim name used for the `Mount` access method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_pvc_name: Option<String>,

    /// Secret holding tool configuration for the `Tool` access method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config_secret_name: Option<String>,
}

impl BackupRepo {
    pub fn backup_pvc_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.backup_pvc_name.as_deref())
    }

    pub fn tool_config_secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tool_config_secret_name.as_deref())
    }
}
