//! Custom Resource Definitions for the restore operator
//!
//! - Backup: a recorded backup and its lineage links
//! - ActionSet: how a workload kind is backed up and restored
//! - BackupRepo: where backup data is stored
//! - Restore: a restore intent and its progress

mod action_set;
mod backup;
mod backup_repo;
mod restore;

pub use action_set::{
    ActionSet, ActionSetSpec, ExecActionSpec, JobActionSpec, PostReadyAction, RestoreActionSpec,
    DEFAULT_TIME_FORMAT,
};
pub use backup::{
    parse_time_zone, Backup, BackupMethodStatus, BackupPhase, BackupSpec, BackupStatus,
    BackupTarget, BackupTimeRange, BackupType, PodSelectionStrategy, PodSelector,
    TargetVolumeInfo,
};
pub use backup_repo::{AccessMethod, BackupRepo, BackupRepoSpec, BackupRepoStatus};
pub use restore::{
    BackupRef, ClaimMetadata, ConnectionCredential, ExecAction, ExecActionTarget, JobAction,
    JobActionTarget, PrepareDataConfig, ReadinessProbe, ReadinessProbeExec, ReadyConfig,
    Restore, RestoreActionStatus, RestoreCondition, RestorePhase, RestoreSpec, RestoreStage,
    RestoreStatus, RestoreStatusAction, RestoreStatusActions, RestoreVolumeClaim,
    RestoreVolumeClaimsTemplate, SchedulingSpec, VolumeClaimRestorePolicy, VolumeConfig,
};
