//! Restore Kubernetes Operator
//!
//! A Kubernetes operator that restores database workloads from recorded
//! backups, including incremental chains and point-in-time recovery.
//!
//! ## Custom Resources
//!
//! - `Restore`: a restore intent; its status records every submitted task
//! - `Backup`: a recorded backup and its lineage links (read only)
//! - `ActionSet`: how a workload kind is restored (read only)
//! - `BackupRepo`: where backup data is stored (read only)
//!
//! Claims whose `dataSourceRef` names a Restore are filled by the volume
//! populator.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: dataprotection.restore.io/v1alpha1
//! kind: Restore
//! metadata:
//!   name: mysql-restore
//! spec:
//!   backup:
//!     name: mysql-inc-20240101
//!     namespace: default
//!   prepareDataConfig:
//!     volumeClaimRestorePolicy: Parallel
//!     volumeClaimsTemplate:
//!       replicas: 3
//!       templates:
//!         - metadata:
//!             name: data-mysql
//!           volumeSource: data
//!           volumeClaimSpec:
//!             accessModes: [ReadWriteOnce]
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod restore;

pub use config::{Args, RestoreSettings};
pub use controllers::{RestoreController, VolumePopulatorController};
pub use crd::{
    ActionSet, Backup, BackupRepo, Restore, RestorePhase, RestoreSpec, RestoreStatus,
};
pub use error::{OperatorError, Result};
