//! Backup lineage resolution
//!
//! Turns the backup named by a restore into the ordered lists of
//! (backup, action set) pairs replayed by the prepare-data and post-ready
//! stages. Incremental chains are walked back to their full anchor,
//! differential backups pull in their parent, and continuous backups are
//! anchored on the latest full backup completed before the restore time.

use super::platform::RestorePlatform;
use crate::crd::{ActionSet, Backup, BackupPhase, BackupType};
use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Labels identifying the workload a backup was taken from
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "apps.restore.io/component-name";

/// A backup together with the action set that knows how to restore it.
#[derive(Debug, Clone)]
pub struct BackupActionSet {
    pub backup: Backup,
    /// None for snapshot-only methods that declare no action set
    pub action_set: Option<ActionSet>,
    /// Full backup a continuous backup is replayed on top of
    pub base_backup: Option<Backup>,
    pub use_volume_snapshot: bool,
}

impl BackupActionSet {
    pub fn backup_name(&self) -> String {
        self.backup.name_any()
    }

    pub fn has_prepare_data_stage(&self) -> bool {
        self.action_set
            .as_ref()
            .is_some_and(ActionSet::has_prepare_data_stage)
    }

    pub fn has_post_ready_stage(&self) -> bool {
        self.action_set
            .as_ref()
            .is_some_and(ActionSet::has_post_ready_stage)
    }
}

/// Ordered backup sets for each restore stage.
#[derive(Debug, Clone, Default)]
pub struct ResolvedBackupSets {
    pub prepare_data: Vec<BackupActionSet>,
    pub post_ready: Vec<BackupActionSet>,
}

impl ResolvedBackupSets {
    /// Route a set to the stages it participates in. Snapshot-based sets
    /// always restore volumes and never run post-ready hooks.
    fn add(&mut self, set: BackupActionSet) {
        if set.use_volume_snapshot {
            self.prepare_data.push(set);
            return;
        }
        if set.has_prepare_data_stage() {
            self.prepare_data.push(set.clone());
        }
        if set.has_post_ready_stage() {
            self.post_ready.push(set);
        }
    }

    fn sort_by_stop_time(&mut self) {
        sort_by_stop_time(&mut self.prepare_data);
        sort_by_stop_time(&mut self.post_ready);
    }
}

/// Ascending by stop time; backups without one go last.
fn sort_by_stop_time(sets: &mut [BackupActionSet]) {
    sets.sort_by_key(|s| (s.backup.stop_time().is_none(), s.backup.stop_time()));
}

/// Parse a restore time in RFC 3339.
pub fn parse_restore_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OperatorError::fatal(format!("invalid restore time {:?}: {}", raw, e)))
}

/// Fetch a backup and pair it with its action set.
pub async fn get_backup_action_set(
    platform: &dyn RestorePlatform,
    namespace: &str,
    name: &str,
) -> Result<BackupActionSet> {
    let backup = platform
        .get_backup(namespace, name)
        .await?
        .ok_or_else(|| OperatorError::fatal(format!("backup {}/{} not found", namespace, name)))?;
    let method = backup.method().ok_or_else(|| {
        OperatorError::fatal(format!(
            "backup {}/{} does not record its backup method",
            namespace, name
        ))
    })?;

    let use_volume_snapshot = backup.uses_volume_snapshot();
    let action_set = match method.action_set_name.as_deref().filter(|n| !n.is_empty()) {
        Some(action_set_name) => Some(
            platform
                .get_action_set(action_set_name)
                .await?
                .ok_or_else(|| {
                    OperatorError::fatal(format!("action set {} not found", action_set_name))
                })?,
        ),
        None if use_volume_snapshot => None,
        None => {
            return Err(OperatorError::fatal(format!(
                "backup method {} of backup {} declares no action set",
                method.name, name
            )))
        }
    };

    Ok(BackupActionSet {
        backup,
        action_set,
        base_backup: None,
        use_volume_snapshot,
    })
}

/// Validate that the requested backup can be restored.
pub fn validate_backup_phase(backup: &Backup) -> Result<()> {
    match (backup.backup_type(), backup.phase()) {
        (_, BackupPhase::Completed) => Ok(()),
        (BackupType::Continuous, BackupPhase::Running) => Ok(()),
        (backup_type, phase) => Err(OperatorError::fatal(format!(
            "{} backup {} is {:?}, expected Completed",
            backup_type,
            backup.name_any(),
            phase
        ))),
    }
}

/// Validate that `parent` may be replayed before `child`.
pub fn validate_parent(parent: &Backup, child: &Backup) -> Result<()> {
    let parent_name = parent.name_any();
    let child_name = child.name_any();

    if parent.spec.backup_policy_name != child.spec.backup_policy_name {
        return Err(OperatorError::fatal(format!(
            "parent backup {} uses policy {}, but backup {} uses policy {}",
            parent_name,
            parent.spec.backup_policy_name,
            child_name,
            child.spec.backup_policy_name
        )));
    }

    match parent.backup_type() {
        BackupType::Incremental => {
            if parent.spec.backup_method != child.spec.backup_method {
                return Err(OperatorError::fatal(format!(
                    "parent backup {} uses method {}, but backup {} uses method {}",
                    parent_name, parent.spec.backup_method, child_name, child.spec.backup_method
                )));
            }
        }
        BackupType::Full => {
            let compatible = child.method().and_then(|m| m.compatible_method.as_deref());
            if compatible != Some(parent.spec.backup_method.as_str()) {
                return Err(OperatorError::fatal(format!(
                    "parent backup {} method {} is not compatible with backup {}",
                    parent_name, parent.spec.backup_method, child_name
                )));
            }
        }
        other => {
            return Err(OperatorError::fatal(format!(
                "parent backup {} has unsupported type {}",
                parent_name, other
            )))
        }
    }

    if parent.phase() != BackupPhase::Completed {
        return Err(OperatorError::fatal(format!(
            "parent backup {} is {:?}, expected Completed",
            parent_name,
            parent.phase()
        )));
    }

    match (parent.stop_time(), child.stop_time()) {
        (Some(parent_stop), Some(child_stop)) if parent_stop < child_stop => Ok(()),
        (Some(_), Some(_)) => Err(OperatorError::fatal(format!(
            "parent backup {} does not stop before backup {}",
            parent_name, child_name
        ))),
        _ => Err(OperatorError::fatal(format!(
            "stop time of backup {} or its parent {} is unknown",
            child_name, parent_name
        ))),
    }
}

fn parent_name(backup: &Backup) -> Result<String> {
    backup
        .spec
        .parent_backup_name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            OperatorError::fatal(format!(
                "{} backup {} has no parent backup",
                backup.backup_type(),
                backup.name_any()
            ))
        })
}

/// Resolve the backup sets replayed by a restore of `backup_name`.
pub async fn resolve(
    platform: &dyn RestorePlatform,
    namespace: &str,
    backup_name: &str,
    restore_time: Option<DateTime<Utc>>,
) -> Result<ResolvedBackupSets> {
    let requested = get_backup_action_set(platform, namespace, backup_name).await?;
    validate_backup_phase(&requested.backup)?;

    let mut sets = ResolvedBackupSets::default();
    match requested.backup.backup_type() {
        BackupType::Full | BackupType::Selective => sets.add(requested),
        BackupType::Incremental => {
            for set in resolve_incremental_chain(platform, namespace, requested).await? {
                sets.add(set);
            }
            sets.sort_by_stop_time();
        }
        BackupType::Differential => {
            let parent =
                get_backup_action_set(platform, namespace, &parent_name(&requested.backup)?)
                    .await
                    .map_err(OperatorError::promote_not_found)?;
            validate_parent(&parent.backup, &requested.backup)?;
            sets.add(parent);
            sets.add(requested);
        }
        BackupType::Continuous => {
            let restore_time = restore_time.ok_or_else(|| {
                OperatorError::fatal(format!(
                    "restore time is required to restore continuous backup {}",
                    backup_name
                ))
            })?;
            let full = find_base_full_backup(platform, namespace, &requested.backup, restore_time)
                .await?;
            let mut continuous = requested;
            continuous.base_backup = Some(full.backup.clone());
            sets.add(full);
            sets.add(continuous);
        }
    }

    debug!(
        "Resolved backup {}/{}: prepareData={:?} postReady={:?}",
        namespace,
        backup_name,
        sets.prepare_data.iter().map(|s| s.backup_name()).collect::<Vec<_>>(),
        sets.post_ready.iter().map(|s| s.backup_name()).collect::<Vec<_>>()
    );
    Ok(sets)
}

/// Walk parent links from an incremental backup back to its full anchor.
async fn resolve_incremental_chain(
    platform: &dyn RestorePlatform,
    namespace: &str,
    requested: BackupActionSet,
) -> Result<Vec<BackupActionSet>> {
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(requested.backup_name());

    let mut chain = vec![requested];
    loop {
        let Some(child) = chain.last() else {
            break;
        };
        if child.backup.backup_type() == BackupType::Full {
            break;
        }
        if child.backup.backup_type() != BackupType::Incremental {
            return Err(OperatorError::fatal(format!(
                "backup {} of type {} cannot appear in an incremental chain",
                child.backup_name(),
                child.backup.backup_type()
            )));
        }

        let parent_name = parent_name(&child.backup)?;
        if !visited.insert(parent_name.clone()) {
            return Err(OperatorError::fatal(format!(
                "backup lineage of {} contains a cycle at {}",
                chain[0].backup_name(),
                parent_name
            )));
        }

        let parent = get_backup_action_set(platform, namespace, &parent_name)
            .await
            .map_err(OperatorError::promote_not_found)?;
        validate_parent(&parent.backup, &child.backup)?;
        chain.push(parent);
    }
    Ok(chain)
}

/// Latest completed full backup of the same workload usable as the base of
/// a point-in-time restore.
async fn find_base_full_backup(
    platform: &dyn RestorePlatform,
    namespace: &str,
    continuous: &Backup,
    restore_time: DateTime<Utc>,
) -> Result<BackupActionSet> {
    let name = continuous.name_any();
    let (Some(start), Some(end)) = (continuous.start_time(), continuous.stop_time()) else {
        return Err(OperatorError::fatal(format!(
            "continuous backup {} has no recorded time range",
            name
        )));
    };
    if restore_time < start || restore_time > end {
        return Err(OperatorError::fatal(format!(
            "restore time {} is outside the time range [{}, {}] of continuous backup {}",
            restore_time.to_rfc3339(),
            start.to_rfc3339(),
            end.to_rfc3339(),
            name
        )));
    }

    let identity: BTreeMap<String, String> = continuous
        .labels()
        .iter()
        .filter(|(k, _)| k.as_str() == LABEL_INSTANCE || k.as_str() == LABEL_COMPONENT)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let anchor = platform
        .list_backups(namespace, &identity)
        .await?
        .into_iter()
        .filter(|b| b.name_any() != name)
        .filter(|b| b.backup_type() == BackupType::Full && b.phase() == BackupPhase::Completed)
        .filter(|b| b.spec.backup_policy_name == continuous.spec.backup_policy_name)
        .filter_map(|b| b.stop_time().map(|stop| (stop, b)))
        .filter(|(stop, _)| *stop <= restore_time && *stop >= start)
        .max_by_key(|(stop, _)| *stop)
        .map(|(_, b)| b)
        .ok_or_else(|| {
            OperatorError::fatal(format!(
                "no completed full backup found for continuous backup {} at {}",
                name,
                restore_time.to_rfc3339()
            ))
        })?;

    get_backup_action_set(platform, namespace, &anchor.name_any()).await
}
