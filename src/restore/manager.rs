//! Restore orchestration
//!
//! [`RestoreManager`] drives one reconciliation pass of a restore through
//! `ValidationPending → PrepareData → ReadinessWait → PostReady → Completed`.
//! Each pass rebuilds the tasks it needs, submits them create-if-absent and
//! records what it observed in the restore status; the pass returns as soon
//! as something is still running, and the caller invokes it again later.

use super::builder::{
    cut_task_name, post_ready_task_name, prepare_data_task_name, readiness_probe_task_name,
    restore_labels, RestoreTaskBuilder, TaskExtras, LABEL_POPULATE_PVC,
};
use super::platform::{task_object_key, task_phase, RestorePlatform, TaskPhase};
use super::resolver::{parse_restore_time, resolve, BackupActionSet, ResolvedBackupSets};
use super::tracker::{aggregate, check_tasks_done, expected_count, recalculate};
use crate::conditions::{
    build_condition, find_condition, is_condition_true, set_condition, stage_condition_type,
    status_for_reason, CONDITION_FALSE, CONDITION_READINESS_PROBE, CONDITION_VALIDATION_PASSED,
    DATA_PROTECTION_FINALIZER, REASON_FAILED, REASON_PROCESSING, REASON_SUCCEED,
    REASON_VALIDATE_FAILED, REASON_VALIDATE_SUCCESSFULLY,
};
use crate::config::RestoreSettings;
use crate::crd::{
    BackupRepo, PodSelectionStrategy, PodSelector, PostReadyAction, PrepareDataConfig, Restore,
    RestorePhase, RestoreStage, RestoreStatus, RestoreVolumeClaim,
};
use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreProgress {
    /// Work is still running; reconcile again later
    InProgress,
    /// Validated and waiting to be consumed by populated claims
    AsDataSource,
    Completed,
    Failed(String),
}

/// Render a duration as `1h2m3s`.
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}

const POPULATE_VOLUME: &str = "dp-claim";

fn volume_name(claim: &RestoreVolumeClaim) -> String {
    format!("dp-claim-{}", claim.metadata.name)
}

fn has_finalizer(job: &Job) -> bool {
    job.finalizers().iter().any(|f| f == DATA_PROTECTION_FINALIZER)
}

/// Delete every task created for a restore, in its own namespace and in
/// the operator namespace.
pub async fn cleanup_tasks(
    platform: &dyn RestorePlatform,
    settings: &RestoreSettings,
    restore: &Restore,
) -> Result<usize> {
    let labels = restore_labels(restore);
    let namespace = restore.namespace().unwrap_or_default();
    let mut deleted = platform.delete_tasks(&namespace, &labels).await?;
    if settings.operator_namespace != namespace {
        deleted += platform
            .delete_tasks(&settings.operator_namespace, &labels)
            .await?;
    }
    Ok(deleted)
}

/// Drives a restore through its phases, one pass at a time.
pub struct RestoreManager<'a> {
    platform: &'a dyn RestorePlatform,
    settings: &'a RestoreSettings,
    /// Working copy; its status reflects everything observed in this pass
    pub restore: Restore,
    restore_time: Option<DateTime<Utc>>,
    resolved: Option<ResolvedBackupSets>,
}

impl<'a> RestoreManager<'a> {
    pub fn new(
        platform: &'a dyn RestorePlatform,
        settings: &'a RestoreSettings,
        restore: Restore,
    ) -> Self {
        Self {
            platform,
            settings,
            restore,
            restore_time: None,
            resolved: None,
        }
    }

    pub fn status(&self) -> RestoreStatus {
        self.restore.status.clone().unwrap_or_default()
    }

    fn phase(&self) -> RestorePhase {
        self.restore
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    fn status_mut(&mut self) -> &mut RestoreStatus {
        self.restore.status.get_or_insert_with(RestoreStatus::default)
    }

    fn namespace(&self) -> String {
        self.restore.namespace().unwrap_or_default()
    }

    fn set_condition(&mut self, condition_type: &str, reason: &str, message: &str) {
        let condition =
            build_condition(condition_type, status_for_reason(reason), reason, message);
        set_condition(&mut self.status_mut().conditions, condition);
    }

    fn condition_true(&self, condition_type: &str) -> bool {
        self.restore
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, condition_type))
    }

    fn set_phase(&mut self, phase: RestorePhase) {
        let name = self.restore.name_any();
        let status = self.status_mut();
        if status.phase != phase {
            info!(restore = %name, "Restore phase {} -> {}", status.phase, phase);
            status.phase = phase;
        }
    }

    /// Whether the restore only feeds claims that reference it.
    pub fn is_data_source(&self) -> bool {
        self.restore
            .spec
            .prepare_data_config
            .as_ref()
            .is_some_and(|c| c.data_source_ref.is_some())
    }

    fn prepare_data_config(&self) -> Option<&PrepareDataConfig> {
        self.restore
            .spec
            .prepare_data_config
            .as_ref()
            .filter(|c| c.has_claims())
    }

    fn finish(&mut self, phase: RestorePhase) {
        let now = Utc::now();
        let start = self
            .restore
            .status
            .as_ref()
            .and_then(|s| s.start_timestamp)
            .or_else(|| self.restore.creation_timestamp().map(|t| t.0))
            .unwrap_or(now);
        self.set_phase(phase);
        let status = self.status_mut();
        status.completion_timestamp = Some(now);
        status.duration = Some(format_duration(now - start));
    }

    /// Run one reconciliation pass. Fatal errors are absorbed into the
    /// `Failed` phase; anything else is returned for a retry.
    pub async fn reconcile(&mut self, workload_ready: bool) -> Result<RestoreProgress> {
        let generation = self.restore.metadata.generation;
        self.status_mut().observed_generation = generation;

        match self.phase() {
            RestorePhase::Completed => return Ok(RestoreProgress::Completed),
            RestorePhase::Failed => return Ok(RestoreProgress::Failed(self.failure_message())),
            RestorePhase::AsDataSource => return Ok(RestoreProgress::AsDataSource),
            _ => {}
        }

        match self.advance(workload_ready).await {
            Err(e) if e.is_fatal() => {
                let message = e.to_string();
                warn!(
                    "Restore {}/{} failed: {}",
                    self.namespace(),
                    self.restore.name_any(),
                    message
                );
                self.finish(RestorePhase::Failed);
                Ok(RestoreProgress::Failed(message))
            }
            other => other,
        }
    }

    fn failure_message(&self) -> String {
        self.restore
            .status
            .as_ref()
            .and_then(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.status == CONDITION_FALSE)
                    .and_then(|c| c.message.clone())
            })
            .unwrap_or_else(|| "restore failed".to_string())
    }

    async fn advance(&mut self, workload_ready: bool) -> Result<RestoreProgress> {
        self.validate_and_resolve().await?;

        if self.is_data_source() {
            self.set_phase(RestorePhase::AsDataSource);
            return Ok(RestoreProgress::AsDataSource);
        }

        if self.phase() == RestorePhase::ValidationPending {
            self.status_mut().start_timestamp = Some(Utc::now());
            self.set_phase(RestorePhase::PrepareData);
        }

        if self.phase() == RestorePhase::PrepareData {
            if !self.prepare_data().await? {
                return Ok(RestoreProgress::InProgress);
            }
            self.set_phase(RestorePhase::ReadinessWait);
        }

        if !self.has_post_ready_stage() {
            self.finish(RestorePhase::Completed);
            return Ok(RestoreProgress::Completed);
        }

        if self.phase() == RestorePhase::ReadinessWait {
            if !self.readiness(workload_ready).await? {
                return Ok(RestoreProgress::InProgress);
            }
            self.set_phase(RestorePhase::PostReady);
        }

        if !self.post_ready().await? {
            return Ok(RestoreProgress::InProgress);
        }
        self.finish(RestorePhase::Completed);
        Ok(RestoreProgress::Completed)
    }

    /// Validate the restore and resolve its backup lineage, once per manager.
    pub async fn validate_and_resolve(&mut self) -> Result<()> {
        if self.resolved.is_some() {
            return Ok(());
        }

        match self.resolve_backup_sets().await {
            Ok(sets) => {
                if !self.condition_true(CONDITION_VALIDATION_PASSED) {
                    self.set_condition(
                        CONDITION_VALIDATION_PASSED,
                        REASON_VALIDATE_SUCCESSFULLY,
                        "validate restore spec successfully",
                    );
                }
                self.resolved = Some(sets);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.set_condition(
                    CONDITION_VALIDATION_PASSED,
                    REASON_VALIDATE_FAILED,
                    &e.to_string(),
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_backup_sets(&mut self) -> Result<ResolvedBackupSets> {
        self.restore_time = self
            .restore
            .spec
            .restore_time
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(parse_restore_time)
            .transpose()?;

        if let Some(template) = self
            .restore
            .spec
            .prepare_data_config
            .as_ref()
            .and_then(|c| c.volume_claims_template.as_ref())
        {
            if template.replicas < 0 || template.starting_index < 0 {
                return Err(OperatorError::fatal(
                    "volumeClaimsTemplate replicas and startingIndex must not be negative",
                ));
            }
        }

        let backup = &self.restore.spec.backup;
        resolve(self.platform, &backup.namespace, &backup.name, self.restore_time).await
    }

    fn resolved(&self) -> Result<&ResolvedBackupSets> {
        self.resolved
            .as_ref()
            .ok_or_else(|| OperatorError::InvalidState("backup sets not resolved".to_string()))
    }

    fn has_post_ready_stage(&self) -> bool {
        self.restore.spec.ready_config.is_some()
            && self
                .resolved
                .as_ref()
                .is_some_and(|s| !s.post_ready.is_empty())
    }

    /// Restore volume data for every backup set in order.
    pub async fn prepare_data(&mut self) -> Result<bool> {
        let condition = stage_condition_type(RestoreStage::PrepareData);
        if self.condition_true(condition) {
            return Ok(true);
        }
        if self.prepare_data_config().is_none() {
            return Ok(true);
        }

        self.set_condition(condition, REASON_PROCESSING, "preparing data");
        let sets = self.resolved()?.prepare_data.clone();
        for set in &sets {
            if !self
                .handle_backup_action_set(set, RestoreStage::PrepareData, 0)
                .await?
            {
                return Ok(false);
            }
        }

        self.set_condition(condition, REASON_SUCCEED, "prepare data successfully");
        Ok(true)
    }

    /// Gate post-ready work on the workload and the optional readiness probe.
    pub async fn readiness(&mut self, workload_ready: bool) -> Result<bool> {
        if !workload_ready {
            debug!("Waiting for workload of restore {} to become ready", self.restore.name_any());
            return Ok(false);
        }
        let Some(probe) = self
            .restore
            .spec
            .ready_config
            .as_ref()
            .and_then(|c| c.readiness_probe.clone())
        else {
            return Ok(true);
        };
        if self.condition_true(CONDITION_READINESS_PROBE) {
            return Ok(true);
        }

        let waiting_since = self
            .restore
            .status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, CONDITION_READINESS_PROBE))
            .and_then(|c| c.last_transition_time.as_deref())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        let Some(waiting_since) = waiting_since else {
            self.set_condition(
                CONDITION_READINESS_PROBE,
                REASON_PROCESSING,
                "workload is ready, running readiness probe",
            );
            if probe.initial_delay_seconds > 0 {
                return Ok(false);
            }
            return self.run_readiness_probe().await;
        };
        if (Utc::now() - waiting_since).num_seconds() < i64::from(probe.initial_delay_seconds) {
            return Ok(false);
        }
        self.run_readiness_probe().await
    }

    async fn run_readiness_probe(&mut self) -> Result<bool> {
        let Some(probe) = self
            .restore
            .spec
            .ready_config
            .as_ref()
            .and_then(|c| c.readiness_probe.clone())
        else {
            return Ok(true);
        };
        let Some(set) = self.resolved()?.post_ready.first().cloned() else {
            return Ok(true);
        };

        let mut builder = RestoreTaskBuilder::new(
            &self.restore,
            self.settings,
            &set,
            RestoreStage::PostReady,
            self.restore_time,
        );
        builder.set_image(&probe.exec.image, &probe.exec.command);

        let credential = self
            .restore
            .spec
            .ready_config
            .as_ref()
            .and_then(|c| c.connection_credential.as_ref());
        let extras = match self.probe_target_selector() {
            Some(selector) => match self
                .target_pods(&selector, PodSelectionStrategy::Any)
                .await?
                .first()
            {
                Some(pod) => builder.target_pod_extras(pod, credential, false, &[]),
                None => TaskExtras::default(),
            },
            None => TaskExtras::default(),
        };

        let mut job = builder.build(&readiness_probe_task_name(&self.restore), 0, extras);
        if let Some(spec) = job.spec.as_mut() {
            let period = probe.period_seconds.max(1);
            spec.active_deadline_seconds = Some(i64::from(probe.timeout_seconds.max(1)));
            spec.backoff_limit = Some((probe.timeout_seconds / period).max(1));
        }

        let job = self.platform.create_task_if_absent(&job).await?;
        match task_phase(&job) {
            TaskPhase::Completed => {
                self.release_task(&job).await?;
                self.set_condition(
                    CONDITION_READINESS_PROBE,
                    REASON_SUCCEED,
                    "readiness probe succeeded",
                );
                Ok(true)
            }
            TaskPhase::Failed(message) => {
                self.release_task(&job).await?;
                let message = format!("readiness probe failed: {}", message);
                self.set_condition(CONDITION_READINESS_PROBE, REASON_FAILED, &message);
                Err(OperatorError::fatal(message))
            }
            TaskPhase::Running | TaskPhase::Pending => Ok(false),
        }
    }

    fn probe_target_selector(&self) -> Option<PodSelector> {
        let ready = self.restore.spec.ready_config.as_ref()?;
        ready
            .job_action
            .as_ref()
            .map(|a| a.target.pod_selector.clone())
            .or_else(|| ready.exec_action.as_ref().map(|a| a.target.pod_selector.clone()))
    }

    /// Run post-ready steps for every backup set in order.
    pub async fn post_ready(&mut self) -> Result<bool> {
        let condition = stage_condition_type(RestoreStage::PostReady);
        if self.condition_true(condition) {
            return Ok(true);
        }

        self.set_condition(condition, REASON_PROCESSING, "processing post ready actions");
        let sets = self.resolved()?.post_ready.clone();
        for set in &sets {
            let steps = set
                .action_set
                .as_ref()
                .map(|a| a.post_ready().len())
                .unwrap_or_default();
            for step in 0..steps {
                if !self
                    .handle_backup_action_set(set, RestoreStage::PostReady, step)
                    .await?
                {
                    return Ok(false);
                }
            }
        }

        self.set_condition(condition, REASON_SUCCEED, "processing post ready actions successfully");
        Ok(true)
    }

    fn is_serial(&self, stage: RestoreStage) -> bool {
        stage == RestoreStage::PrepareData
            && self
                .prepare_data_config()
                .is_some_and(PrepareDataConfig::is_serial_policy)
    }

    fn expected_replicas(&self) -> usize {
        self.prepare_data_config()
            .map(PrepareDataConfig::expected_replicas)
            .unwrap_or(1)
    }

    /// Build, submit and track the tasks of one action of one backup set.
    /// Returns whether the action has finished successfully.
    pub async fn handle_backup_action_set(
        &mut self,
        set: &BackupActionSet,
        stage: RestoreStage,
        step: usize,
    ) -> Result<bool> {
        let backup_name = set.backup_name();
        let action_name = stage.action_name(step);
        let serial = self.is_serial(stage);
        let replicas = self.expected_replicas();

        let actions = self.status().actions;
        let expected = expected_count(&actions, stage, &backup_name, &action_name, replicas);
        let recorded = recalculate(
            &actions,
            serial,
            &backup_name,
            &action_name,
            expected,
            aggregate(&actions, stage, &backup_name, &action_name, expected),
        );
        if recorded.all_finished {
            if recorded.any_failed {
                return Err(self.stage_failed(stage, &backup_name));
            }
            return Ok(true);
        }

        let progress = loop {
            let completed_before = self
                .status()
                .actions
                .completed_count(stage, &backup_name, &action_name);
            let jobs = match stage {
                RestoreStage::PrepareData => self.build_prepare_data_tasks(set).await?,
                RestoreStage::PostReady => self.build_post_ready_tasks(set, step).await?,
            };
            if jobs.is_empty() {
                return Ok(true);
            }

            let mut submitted = Vec::with_capacity(jobs.len());
            for job in &jobs {
                submitted.push(self.platform.create_task_if_absent(job).await?);
            }

            let progress = check_tasks_done(
                &mut self.status_mut().actions,
                stage,
                &backup_name,
                &action_name,
                &submitted,
            );
            for job in &submitted {
                if task_phase(job).is_terminal() {
                    self.release_task(job).await?;
                }
            }

            let actions = self.status().actions;
            let expected = expected_count(&actions, stage, &backup_name, &action_name, replicas);
            let progress =
                recalculate(&actions, serial, &backup_name, &action_name, expected, progress);

            // a serial replica that finished in this pass is followed by the
            // next one right away
            let completed = actions.completed_count(stage, &backup_name, &action_name);
            if serial && !progress.all_finished && !progress.any_failed && completed > completed_before {
                debug!(
                    restore = %self.restore.name_any(),
                    backup = %backup_name,
                    completed,
                    "Serial replica finished, submitting the next one"
                );
                continue;
            }
            break progress;
        };
        if !progress.all_finished {
            return Ok(false);
        }
        if progress.any_failed {
            return Err(self.stage_failed(stage, &backup_name));
        }
        info!(
            restore = %self.restore.name_any(),
            backup = %backup_name,
            action = %action_name,
            "Restore action finished"
        );
        Ok(true)
    }

    fn stage_failed(&mut self, stage: RestoreStage, backup_name: &str) -> OperatorError {
        let message = format!(
            "restore failed for backup {}, more information can be found in status.actions.{}",
            backup_name,
            stage.as_str()
        );
        self.set_condition(stage_condition_type(stage), REASON_FAILED, &message);
        OperatorError::fatal(message)
    }

    async fn release_task(&self, job: &Job) -> Result<()> {
        if has_finalizer(job) {
            let namespace = job.namespace().unwrap_or_default();
            self.platform
                .remove_task_finalizer(&namespace, &job.name_any())
                .await?;
        }
        Ok(())
    }

    async fn backup_repo(&self, set: &BackupActionSet) -> Result<Option<BackupRepo>> {
        let Some(repo_name) = set
            .backup
            .status
            .as_ref()
            .and_then(|s| s.backup_repo_name.as_deref())
            .filter(|n| !n.is_empty())
        else {
            return Ok(None);
        };
        self.platform
            .get_backup_repo(repo_name)
            .await?
            .map(Some)
            .ok_or_else(|| OperatorError::fatal(format!("backup repo {} not found", repo_name)))
    }

    /// Backup sets replayed by prepare-data tasks, in restore order.
    pub fn prepare_data_sets(&self) -> Result<Vec<BackupActionSet>> {
        Ok(self.resolved()?.prepare_data.clone())
    }

    /// Task filling the populate claim `populate_pvc` from one backup set,
    /// mounted the way the restore's `dataSourceRef` describes. `None` when
    /// the set has nothing to replay by task.
    pub async fn build_volume_populate_job(
        &self,
        set: &BackupActionSet,
        populate_pvc: &str,
        index: usize,
    ) -> Result<Option<Job>> {
        let Some(source) = self
            .restore
            .spec
            .prepare_data_config
            .as_ref()
            .and_then(|c| c.data_source_ref.as_ref())
        else {
            return Ok(None);
        };
        let Some(action) = set.action_set.as_ref().and_then(|a| a.prepare_data()) else {
            return Ok(None);
        };

        let mut builder = RestoreTaskBuilder::new(
            &self.restore,
            self.settings,
            set,
            RestoreStage::PrepareData,
            self.restore_time,
        );
        builder
            .set_image(&action.image, &action.command)
            .add_label(LABEL_POPULATE_PVC, populate_pvc);
        if let Some(repo) = self.backup_repo(set).await? {
            builder.attach_backup_repo(&repo)?;
        }

        let mut extras = TaskExtras::default();
        if let Some((volume, mount)) =
            builder.claim_volume(source, populate_pvc, POPULATE_VOLUME)?
        {
            extras.add_volume(volume, mount);
        }
        let name = cut_task_name(format!("{}-{}", populate_pvc, index));
        Ok(Some(builder.build(&name, index, extras)))
    }

    /// Prepare-data tasks of one backup set; claims are created on the way.
    async fn build_prepare_data_tasks(&self, set: &BackupActionSet) -> Result<Vec<Job>> {
        let Some(config) = self.prepare_data_config() else {
            return Ok(Vec::new());
        };
        let mut builder = RestoreTaskBuilder::new(
            &self.restore,
            self.settings,
            set,
            RestoreStage::PrepareData,
            self.restore_time,
        );

        if set.use_volume_snapshot {
            self.restore_pvcs_from_snapshot(set, config, &builder).await?;
        }
        let Some(action) = set.action_set.as_ref().and_then(|a| a.prepare_data()) else {
            return Ok(Vec::new());
        };

        builder.set_image(&action.image, &action.command);
        if let Some(repo) = self.backup_repo(set).await? {
            builder.attach_backup_repo(&repo)?;
        }

        let mut common = TaskExtras::default();
        for claim in &config.volume_claims {
            if !set.use_volume_snapshot {
                let pvc = builder.build_pvc(claim, &claim.metadata.name, None);
                self.platform.create_pvc_if_absent(&pvc).await?;
            }
            if let Some((volume, mount)) =
                builder.claim_volume(&claim.volume_config, &claim.metadata.name, &volume_name(claim))?
            {
                common.add_volume(volume, mount);
            }
        }

        let backup_name = set.backup_name();
        let action_name = RestoreStage::PrepareData.action_name(0);
        let replicas = config.expected_replicas();
        let actions = self.status().actions;
        let serial = config.is_serial_policy();

        // serial restores submit one replica at a time; completed tasks are
        // removed while their records stay in the status
        let mut limit = replicas;
        if serial {
            let completed = actions.completed_count(RestoreStage::PrepareData, &backup_name, &action_name);
            limit = (completed + 1).min(replicas);
            for index in 0..replicas {
                let name = prepare_data_task_name(&self.restore, &backup_name, index);
                let key = task_object_key(builder.namespace(), &name);
                if !actions.is_task_completed(RestoreStage::PrepareData, &key) {
                    continue;
                }
                if let Some(task) = self.platform.get_task(builder.namespace(), &name).await? {
                    self.release_task(&task).await?;
                    self.platform.delete_task(builder.namespace(), &name).await?;
                }
            }
        }

        let mut jobs = Vec::with_capacity(limit);
        for index in 0..limit {
            let name = prepare_data_task_name(&self.restore, &backup_name, index);
            let key = task_object_key(builder.namespace(), &name);
            if serial && actions.is_task_completed(RestoreStage::PrepareData, &key) {
                continue;
            }

            let mut extras = common.clone();
            if let Some(template) = &config.volume_claims_template {
                let ordinal = template.starting_index.max(0) as usize + index;
                for claim in &template.templates {
                    let claim_name = format!("{}-{}", claim.metadata.name, ordinal);
                    if !set.use_volume_snapshot {
                        let pvc = builder.build_pvc(claim, &claim_name, None);
                        self.platform.create_pvc_if_absent(&pvc).await?;
                    }
                    if let Some((volume, mount)) =
                        builder.claim_volume(&claim.volume_config, &claim_name, &volume_name(claim))?
                    {
                        extras.add_volume(volume, mount);
                    }
                    extras.labels.extend(claim.metadata.labels.clone());
                }
            }
            jobs.push(builder.build(&name, index, extras));
        }
        Ok(jobs)
    }

    /// Create every restored claim from the snapshot of its source volume.
    async fn restore_pvcs_from_snapshot(
        &self,
        set: &BackupActionSet,
        config: &PrepareDataConfig,
        builder: &RestoreTaskBuilder<'_>,
    ) -> Result<()> {
        let backup_name = set.backup_name();
        let snapshot_name = |claim: &RestoreVolumeClaim| -> Result<String> {
            claim
                .volume_config
                .volume_source
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|source| format!("{}-{}", backup_name, source))
                .ok_or_else(|| {
                    OperatorError::fatal(format!(
                        "volumeSource of claim {} is required to restore from volume snapshots",
                        claim.metadata.name
                    ))
                })
        };

        for claim in &config.volume_claims {
            let pvc = builder.build_pvc(claim, &claim.metadata.name, Some(snapshot_name(claim)?));
            self.platform.create_pvc_if_absent(&pvc).await?;
        }
        if let Some(template) = &config.volume_claims_template {
            for index in 0..config.expected_replicas() {
                let ordinal = template.starting_index.max(0) as usize + index;
                for claim in &template.templates {
                    let claim_name = format!("{}-{}", claim.metadata.name, ordinal);
                    let pvc = builder.build_pvc(claim, &claim_name, Some(snapshot_name(claim)?));
                    self.platform.create_pvc_if_absent(&pvc).await?;
                }
            }
        }
        Ok(())
    }

    /// Pods a post-ready action runs against, ordered by name.
    async fn target_pods(
        &self,
        selector: &PodSelector,
        default_strategy: PodSelectionStrategy,
    ) -> Result<Vec<Pod>> {
        let mut pods = self
            .platform
            .list_pods(&self.namespace(), &selector.label_selector)
            .await?;
        if pods.is_empty() {
            return Err(OperatorError::waiting(format!(
                "no target pods found in namespace {}",
                self.namespace()
            )));
        }
        pods.sort_by_key(|p| p.name_any());
        if selector.strategy.unwrap_or(default_strategy) == PodSelectionStrategy::Any {
            pods.truncate(1);
        }
        Ok(pods)
    }

    /// Tasks of post-ready step `step` of one backup set.
    async fn build_post_ready_tasks(&self, set: &BackupActionSet, step: usize) -> Result<Vec<Job>> {
        let Some(action) = set
            .action_set
            .as_ref()
            .and_then(|a| a.post_ready().get(step))
        else {
            return Ok(Vec::new());
        };
        let Some(ready_config) = self.restore.spec.ready_config.as_ref() else {
            return Ok(Vec::new());
        };
        let backup_name = set.backup_name();
        let mut builder = RestoreTaskBuilder::new(
            &self.restore,
            self.settings,
            set,
            RestoreStage::PostReady,
            self.restore_time,
        );

        let mut jobs = Vec::new();
        match action {
            PostReadyAction::Job(job_spec) => {
                let job_action = ready_config.job_action.as_ref().ok_or_else(|| {
                    OperatorError::fatal(format!(
                        "readyConfig.jobAction is required by post ready step {} of backup {}",
                        step, backup_name
                    ))
                })?;
                let pods = self
                    .target_pods(&job_action.target.pod_selector, PodSelectionStrategy::Any)
                    .await?;

                builder.set_image(&job_spec.image, &job_spec.command);
                if let Some(repo) = self.backup_repo(set).await? {
                    builder.attach_backup_repo(&repo)?;
                }
                for (index, pod) in pods.iter().enumerate() {
                    let extras = builder.target_pod_extras(
                        pod,
                        ready_config.connection_credential.as_ref(),
                        job_spec.run_on_target_pod_node,
                        &job_action.target.volume_mounts,
                    );
                    let name = post_ready_task_name(&self.restore, &backup_name, step, index);
                    jobs.push(builder.build(&name, index, extras));
                }
            }
            PostReadyAction::Exec(exec) => {
                let exec_action = ready_config.exec_action.as_ref().ok_or_else(|| {
                    OperatorError::fatal(format!(
                        "readyConfig.execAction is required by post ready step {} of backup {}",
                        step, backup_name
                    ))
                })?;
                let pods = self
                    .target_pods(&exec_action.target.pod_selector, PodSelectionStrategy::All)
                    .await?;

                builder.run_in_operator_namespace();
                let namespace = self.namespace();
                for (index, pod) in pods.iter().enumerate() {
                    let container = exec
                        .container
                        .clone()
                        .filter(|c| !c.is_empty())
                        .or_else(|| {
                            pod.spec
                                .as_ref()
                                .and_then(|s| s.containers.first())
                                .map(|c| c.name.clone())
                        })
                        .unwrap_or_default();
                    let mut command = vec![
                        "kubectl".to_string(),
                        "exec".to_string(),
                        "-n".to_string(),
                        namespace.clone(),
                        "-i".to_string(),
                        pod.name_any(),
                        "-c".to_string(),
                        container,
                        "--".to_string(),
                    ];
                    command.extend(exec.command.iter().cloned());
                    builder.set_image(&self.settings.tools_image, &command);

                    let extras = TaskExtras {
                        tolerations: pod
                            .spec
                            .as_ref()
                            .and_then(|s| s.tolerations.clone())
                            .unwrap_or_default(),
                        ..Default::default()
                    };
                    let name = post_ready_task_name(&self.restore, &backup_name, step, index);
                    jobs.push(builder.build(&name, index, extras));
                }
            }
        }
        Ok(jobs)
    }
}
