//! Action bookkeeping
//!
//! The restore status carries one record per submitted task. Records are
//! keyed by backup, action and task object key; a terminal record is never
//! overwritten, so a failure observed once stays visible for good.

use super::platform::{task_object_key, task_phase, TaskPhase};
use crate::crd::{RestoreActionStatus, RestoreStage, RestoreStatusAction, RestoreStatusActions};
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;

/// Whether an action's tasks are all done, and whether any failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionProgress {
    pub all_finished: bool,
    pub any_failed: bool,
}

impl RestoreStatusActions {
    /// Records of one action of one backup, in insertion order.
    pub fn records<'a>(
        &'a self,
        stage: RestoreStage,
        backup_name: &'a str,
        action_name: &'a str,
    ) -> impl Iterator<Item = &'a RestoreStatusAction> + 'a {
        self.stage(stage)
            .iter()
            .filter(move |r| r.backup_name == backup_name && r.name == action_name)
    }

    pub fn completed_count(&self, stage: RestoreStage, backup_name: &str, action_name: &str) -> usize {
        self.records(stage, backup_name, action_name)
            .filter(|r| r.status == RestoreActionStatus::Completed)
            .count()
    }

    /// Whether the task behind `object_key` already completed.
    pub fn is_task_completed(&self, stage: RestoreStage, object_key: &str) -> bool {
        self.stage(stage)
            .iter()
            .any(|r| r.object_key == object_key && r.status == RestoreActionStatus::Completed)
    }

    /// Insert or update a record. Terminal records are left untouched.
    /// Returns whether the status changed.
    pub fn record_result(&mut self, stage: RestoreStage, record: RestoreStatusAction) -> bool {
        let records = self.stage_mut(stage);
        let existing = records.iter_mut().find(|r| {
            r.object_key == record.object_key
                && r.backup_name == record.backup_name
                && r.name == record.name
        });

        match existing {
            None => {
                records.push(record);
                true
            }
            Some(existing) if existing.status.is_terminal() => false,
            Some(existing) => {
                if existing.status == record.status && existing.message == record.message {
                    return false;
                }
                existing.status = record.status;
                existing.message = record.message;
                if record.end_time.is_some() {
                    existing.end_time = record.end_time;
                }
                if existing.start_time.is_none() {
                    existing.start_time = record.start_time;
                }
                true
            }
        }
    }
}

/// Record the observed state of a task. Returns whether the status changed.
pub fn observe_task(
    actions: &mut RestoreStatusActions,
    stage: RestoreStage,
    backup_name: &str,
    action_name: &str,
    job: &Job,
) -> bool {
    let now = Utc::now();
    let (status, message, end_time) = match task_phase(job) {
        TaskPhase::Completed => (RestoreActionStatus::Completed, None, Some(now)),
        TaskPhase::Failed(msg) => (RestoreActionStatus::Failed, Some(msg), Some(now)),
        TaskPhase::Running | TaskPhase::Pending => (RestoreActionStatus::Processing, None, None),
    };
    let start_time = job
        .status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .map(|t| t.0)
        .or(Some(now));

    actions.record_result(
        stage,
        RestoreStatusAction {
            name: action_name.to_string(),
            backup_name: backup_name.to_string(),
            object_key: task_object_key(&job.namespace().unwrap_or_default(), &job.name_any()),
            status,
            message,
            start_time,
            end_time,
        },
    )
}

/// Record every task of one pass and report whether they are all done.
pub fn check_tasks_done(
    actions: &mut RestoreStatusActions,
    stage: RestoreStage,
    backup_name: &str,
    action_name: &str,
    jobs: &[Job],
) -> ActionProgress {
    let mut progress = ActionProgress {
        all_finished: true,
        any_failed: false,
    };
    for job in jobs {
        observe_task(actions, stage, backup_name, action_name, job);
        match task_phase(job) {
            TaskPhase::Completed => {}
            TaskPhase::Failed(_) => progress.any_failed = true,
            TaskPhase::Running | TaskPhase::Pending => progress.all_finished = false,
        }
    }
    progress
}

/// Summarize the records of an action against the number of tasks expected.
pub fn aggregate(
    actions: &RestoreStatusActions,
    stage: RestoreStage,
    backup_name: &str,
    action_name: &str,
    expected: usize,
) -> ActionProgress {
    let mut finished = 0;
    let mut any_failed = false;
    for record in actions.records(stage, backup_name, action_name) {
        match record.status {
            RestoreActionStatus::Completed => finished += 1,
            RestoreActionStatus::Failed => {
                finished += 1;
                any_failed = true;
            }
            RestoreActionStatus::Processing => {}
        }
    }
    ActionProgress {
        all_finished: expected > 0 && finished == expected,
        any_failed,
    }
}

/// Number of tasks an action is expected to produce: the configured replicas
/// for prepare-data, the tasks recorded so far for post-ready.
pub fn expected_count(
    actions: &RestoreStatusActions,
    stage: RestoreStage,
    backup_name: &str,
    action_name: &str,
    prepare_data_replicas: usize,
) -> usize {
    match stage {
        RestoreStage::PrepareData => prepare_data_replicas,
        RestoreStage::PostReady => actions.records(stage, backup_name, action_name).count(),
    }
}

/// Adjust progress for serial restores, where tasks are submitted one at a
/// time: a failure ends the action, otherwise it is finished only once every
/// replica has a record.
pub fn recalculate(
    actions: &RestoreStatusActions,
    serial: bool,
    backup_name: &str,
    action_name: &str,
    expected: usize,
    progress: ActionProgress,
) -> ActionProgress {
    if !serial {
        return progress;
    }
    if progress.any_failed {
        return ActionProgress {
            all_finished: true,
            any_failed: true,
        };
    }
    let recorded = actions
        .records(RestoreStage::PrepareData, backup_name, action_name)
        .count();
    ActionProgress {
        all_finished: progress.all_finished && recorded == expected,
        any_failed: false,
    }
}
