//! Volume populator
//!
//! Fills claims whose `dataSourceRef` names a Restore. Prepare-data tasks
//! restore the backup into a temporary populate claim; once they finish the
//! volume behind it is rebound to the requesting claim. After that claim
//! binds, the tasks and the populate claim are removed.

use super::builder::{HOSTNAME_LABEL, LABEL_POPULATE_PVC, SNAPSHOT_API_GROUP};
use super::manager::RestoreManager;
use super::platform::{task_phase, RestorePlatform, TaskPhase};
use super::resolver::BackupActionSet;
use crate::conditions::{
    CONDITION_POPULATING, CONDITION_TRUE, DATA_PROTECTION_FINALIZER, REASON_POPULATING_FAILED,
    REASON_POPULATING_PROCESSING, REASON_POPULATING_SUCCEED,
};
use crate::config::RestoreSettings;
use crate::crd::{Restore, SchedulingSpec, VolumeConfig};
use crate::error::{OperatorError, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, PersistentVolumeClaimCondition,
    PersistentVolumeClaimSpec, Toleration, TypedObjectReference,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Node the scheduler picked for a claim with delayed binding
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
/// Set on claims of in-tree plugins that were migrated to CSI
pub const ANN_MIGRATED_TO: &str = "pv.kubernetes.io/migrated-to";

const IN_TREE_PROVISIONER_PREFIX: &str = "kubernetes.io/";
const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Outcome of a populator pass over one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulateProgress {
    /// The claim does not reference a restore
    Skipped,
    /// Delayed binding; the scheduler has not picked a node yet
    WaitingForNode,
    /// Tasks or the populate claim are still in flight
    InProgress,
    /// Data restored and the volume handed over to the claim
    Populated,
    /// Claim bound; temporary objects removed
    CleanedUp,
    Failed(String),
}

enum Placement {
    Anywhere,
    Node(String),
    AwaitingNode,
}

/// Name of the temporary claim populated on behalf of `pvc`.
pub fn populate_pvc_name(pvc: &PersistentVolumeClaim) -> String {
    format!("populate-pvc-{}", pvc.uid().unwrap_or_default())
}

/// Name of the restore a claim should be populated from, if any.
pub fn match_to_populate(pvc: &PersistentVolumeClaim) -> Result<Option<String>> {
    let Some(source) = pvc.spec.as_ref().and_then(|s| s.data_source_ref.as_ref()) else {
        return Ok(None);
    };
    let group = Restore::group(&());
    if source.api_group.as_deref() != Some(group.as_ref())
        || source.kind != Restore::kind(&())
        || source.name.is_empty()
    {
        return Ok(None);
    }

    let namespace = pvc.namespace().unwrap_or_default();
    if let Some(other) = source.namespace.as_deref().filter(|ns| *ns != namespace) {
        return Err(OperatorError::fatal(format!(
            "restore {}/{} must be in the namespace of claim {}/{}",
            other,
            source.name,
            namespace,
            pvc.name_any()
        )));
    }
    Ok(Some(source.name.clone()))
}

/// Conditions after recording `reason`, or `None` when nothing changes.
/// A claim that finished populating keeps its condition.
pub fn update_populating_condition(
    conditions: &[PersistentVolumeClaimCondition],
    reason: &str,
    message: &str,
) -> Option<Vec<PersistentVolumeClaimCondition>> {
    let condition = PersistentVolumeClaimCondition {
        type_: CONDITION_POPULATING.to_string(),
        status: CONDITION_TRUE.to_string(),
        last_transition_time: Some(Time(Utc::now())),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        ..Default::default()
    };

    let mut updated = conditions.to_vec();
    match updated.iter_mut().find(|c| c.type_ == CONDITION_POPULATING) {
        Some(existing) => {
            let current = existing.reason.as_deref();
            if current == Some(reason) || current == Some(REASON_POPULATING_SUCCEED) {
                return None;
            }
            *existing = condition;
        }
        None => updated.push(condition),
    }
    Some(updated)
}

fn populating_reason(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == CONDITION_POPULATING)?
        .reason
        .as_deref()
}

/// In-tree plugins cannot be populated unless the claim was migrated to CSI.
fn check_in_tree_provisioner(pvc: &PersistentVolumeClaim, class: &StorageClass) -> Result<()> {
    if !class.provisioner.starts_with(IN_TREE_PROVISIONER_PREFIX) {
        return Ok(());
    }
    if pvc
        .annotations()
        .get(ANN_MIGRATED_TO)
        .is_some_and(|m| !m.is_empty())
    {
        return Ok(());
    }
    Err(OperatorError::fatal(format!(
        "in-tree volume plugin {:?} cannot use the volume populator",
        class.provisioner
    )))
}

fn is_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .is_some_and(|v| !v.is_empty())
}

fn claim_reference(pvc: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        namespace: pvc.namespace(),
        name: Some(pvc.name_any()),
        uid: pvc.uid(),
        resource_version: pvc.resource_version(),
        ..Default::default()
    }
}

/// Populates claims from the restores they reference.
pub struct VolumePopulator<'a> {
    platform: &'a dyn RestorePlatform,
    settings: &'a RestoreSettings,
}

impl<'a> VolumePopulator<'a> {
    pub fn new(platform: &'a dyn RestorePlatform, settings: &'a RestoreSettings) -> Self {
        Self { platform, settings }
    }

    /// Run one pass for a claim. Fatal errors are recorded on the claim's
    /// populating condition and reported as `Failed`.
    pub async fn reconcile(&self, pvc: &PersistentVolumeClaim) -> Result<PopulateProgress> {
        match self.sync(pvc).await {
            Err(e) if e.is_fatal() => {
                let message = e.to_string();
                warn!(
                    "Populating PVC {}/{} failed: {}",
                    pvc.namespace().unwrap_or_default(),
                    pvc.name_any(),
                    message
                );
                self.update_condition(pvc, REASON_POPULATING_FAILED, &message)
                    .await?;
                Ok(PopulateProgress::Failed(message))
            }
            other => other,
        }
    }

    async fn sync(&self, pvc: &PersistentVolumeClaim) -> Result<PopulateProgress> {
        let Some(restore_name) = match_to_populate(pvc)? else {
            return Ok(PopulateProgress::Skipped);
        };
        if is_bound(pvc) {
            self.cleanup(pvc).await?;
            return Ok(PopulateProgress::CleanedUp);
        }
        if populating_reason(pvc) == Some(REASON_POPULATING_FAILED) {
            return Ok(PopulateProgress::Failed(format!(
                "populating from restore {} failed",
                restore_name
            )));
        }

        let namespace = pvc.namespace().unwrap_or_default();
        let restore = self
            .platform
            .get_restore(&namespace, &restore_name)
            .await?
            .ok_or_else(|| {
                OperatorError::waiting(format!("restore {}/{} not found", namespace, restore_name))
            })?;
        let Some(source) = restore
            .spec
            .prepare_data_config
            .as_ref()
            .and_then(|c| c.data_source_ref.clone())
        else {
            return Err(OperatorError::fatal(format!(
                "spec.prepareDataConfig.dataSourceRef of restore {} must be set",
                restore_name
            )));
        };

        self.populate(pvc, restore, &source).await
    }

    async fn placement(&self, pvc: &PersistentVolumeClaim) -> Result<Placement> {
        let Some(class_name) = pvc
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.as_deref())
            .filter(|n| !n.is_empty())
        else {
            return Ok(Placement::Anywhere);
        };
        let class = self
            .platform
            .get_storage_class(class_name)
            .await?
            .ok_or_else(|| {
                OperatorError::NotFound(format!("storage class {} not found", class_name))
            })?;
        check_in_tree_provisioner(pvc, &class)?;

        if class.volume_binding_mode.as_deref() != Some(WAIT_FOR_FIRST_CONSUMER) {
            return Ok(Placement::Anywhere);
        }
        Ok(match pvc.annotations().get(ANN_SELECTED_NODE).filter(|n| !n.is_empty()) {
            Some(node) => Placement::Node(node.clone()),
            None => Placement::AwaitingNode,
        })
    }

    async fn populate(
        &self,
        pvc: &PersistentVolumeClaim,
        mut restore: Restore,
        source: &VolumeConfig,
    ) -> Result<PopulateProgress> {
        let node = match self.placement(pvc).await? {
            Placement::AwaitingNode => {
                debug!("PVC {} waits for a selected node", pvc.name_any());
                return Ok(PopulateProgress::WaitingForNode);
            }
            Placement::Node(node) => Some(node),
            Placement::Anywhere => None,
        };

        self.ensure_finalizer(pvc).await?;
        self.update_condition(pvc, REASON_POPULATING_PROCESSING, "populator started")
            .await?;

        // populate tasks tolerate every taint and follow the claim's node
        let restore_name = restore.name_any();
        if let Some(config) = restore.spec.prepare_data_config.as_mut() {
            config.scheduling_spec = SchedulingSpec {
                tolerations: vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            };
            if let Some(node) = &node {
                config
                    .scheduling_spec
                    .node_selector
                    .insert(HOSTNAME_LABEL.to_string(), node.clone());
            }
        }

        let mut manager = RestoreManager::new(self.platform, self.settings, restore);
        manager.validate_and_resolve().await?;
        let sets = manager.prepare_data_sets()?;
        let Some(first) = sets.first() else {
            return Err(OperatorError::fatal(format!(
                "restore {} has no backup data to populate from",
                restore_name
            )));
        };

        let populate_name = populate_pvc_name(pvc);
        self.ensure_populate_pvc(pvc, &populate_name, first, source, node.as_deref())
            .await?;

        for (index, set) in sets.iter().enumerate() {
            let Some(mut job) = manager
                .build_volume_populate_job(set, &populate_name, index)
                .await?
            else {
                continue;
            };
            job.metadata.owner_references = pvc.controller_owner_ref(&()).map(|r| vec![r]);

            let job = self.platform.create_task_if_absent(&job).await?;
            match task_phase(&job) {
                TaskPhase::Completed => {}
                TaskPhase::Failed(message) => {
                    return Err(OperatorError::fatal(format!(
                        "populate task {} failed: {}",
                        job.name_any(),
                        message
                    )));
                }
                TaskPhase::Pending | TaskPhase::Running => {
                    return Ok(PopulateProgress::InProgress);
                }
            }
        }

        if !self.rebind(pvc, &populate_name, &restore_name).await? {
            return Ok(PopulateProgress::InProgress);
        }
        self.update_condition(pvc, REASON_POPULATING_SUCCEED, "populator finished")
            .await?;
        info!("Populated PVC {} from restore {}", pvc.name_any(), restore_name);
        Ok(PopulateProgress::Populated)
    }

    /// Create the claim the tasks restore into; it copies the requesting
    /// claim's storage and is cloned from the volume snapshot when the
    /// backup took one.
    async fn ensure_populate_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
        name: &str,
        set: &BackupActionSet,
        source: &VolumeConfig,
        node: Option<&str>,
    ) -> Result<()> {
        let spec = pvc.spec.clone().unwrap_or_default();
        let mut populate_spec = PersistentVolumeClaimSpec {
            access_modes: spec.access_modes,
            resources: spec.resources,
            storage_class_name: spec.storage_class_name,
            volume_mode: spec.volume_mode,
            ..Default::default()
        };
        if set.use_volume_snapshot {
            let volume_source = source
                .volume_source
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    OperatorError::fatal(
                        "dataSourceRef.volumeSource is required to populate from volume snapshots",
                    )
                })?;
            populate_spec.data_source_ref = Some(TypedObjectReference {
                api_group: Some(SNAPSHOT_API_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name: format!("{}-{}", set.backup_name(), volume_source),
                namespace: None,
            });
        }

        let populate = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: pvc.namespace(),
                annotations: node.map(|n| {
                    BTreeMap::from([(ANN_SELECTED_NODE.to_string(), n.to_string())])
                }),
                ..Default::default()
            },
            spec: Some(populate_spec),
            ..Default::default()
        };
        self.platform.create_pvc_if_absent(&populate).await?;
        Ok(())
    }

    /// Hand the populated volume over to `pvc`. Returns false while the
    /// populate claim has no volume yet.
    async fn rebind(
        &self,
        pvc: &PersistentVolumeClaim,
        populate_name: &str,
        restore_name: &str,
    ) -> Result<bool> {
        let namespace = pvc.namespace().unwrap_or_default();
        let Some(volume_name) = self
            .platform
            .get_pvc(&namespace, populate_name)
            .await?
            .and_then(|p| p.spec)
            .and_then(|s| s.volume_name)
            .filter(|v| !v.is_empty())
        else {
            debug!("Populate PVC {}/{} is not bound yet", namespace, populate_name);
            return Ok(false);
        };
        let Some(volume) = self.platform.get_persistent_volume(&volume_name).await? else {
            return Ok(false);
        };

        let claim = claim_reference(pvc);
        let current = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
        let already_bound = current.is_some_and(|r| {
            r.name == claim.name && r.namespace == claim.namespace && r.uid == claim.uid
        });
        if !already_bound {
            self.platform
                .rebind_persistent_volume(&volume_name, &claim, restore_name)
                .await?;
        }
        Ok(true)
    }

    /// Remove the finalizer, the populate tasks and the populate claim.
    async fn cleanup(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let namespace = pvc.namespace().unwrap_or_default();
        let name = pvc.name_any();
        if pvc.finalizers().iter().any(|f| f == DATA_PROTECTION_FINALIZER) {
            let finalizers: Vec<String> = pvc
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != DATA_PROTECTION_FINALIZER)
                .cloned()
                .collect();
            self.platform
                .set_pvc_finalizers(&namespace, &name, &finalizers)
                .await?;
        }

        let populate_name = populate_pvc_name(pvc);
        let labels = BTreeMap::from([(LABEL_POPULATE_PVC.to_string(), populate_name.clone())]);
        let deleted = self.platform.delete_tasks(&namespace, &labels).await?;
        self.platform.delete_pvc(&namespace, &populate_name).await?;
        debug!(pvc = %name, tasks = deleted, "Cleaned up populate resources");
        Ok(())
    }

    async fn ensure_finalizer(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        if pvc.finalizers().iter().any(|f| f == DATA_PROTECTION_FINALIZER) {
            return Ok(());
        }
        let mut finalizers = pvc.finalizers().to_vec();
        finalizers.push(DATA_PROTECTION_FINALIZER.to_string());
        self.platform
            .set_pvc_finalizers(&pvc.namespace().unwrap_or_default(), &pvc.name_any(), &finalizers)
            .await
    }

    async fn update_condition(
        &self,
        pvc: &PersistentVolumeClaim,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let conditions = pvc
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default();
        let Some(updated) = update_populating_condition(&conditions, reason, message) else {
            return Ok(());
        };
        self.platform
            .set_pvc_conditions(&pvc.namespace().unwrap_or_default(), &pvc.name_any(), &updated)
            .await?;
        debug!(pvc = %pvc.name_any(), reason, "Updated populating condition");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VolumeClaimRestorePolicy;
    use crate::restore::platform::ANN_POPULATED_FROM;
    use crate::restore::testing::{self, FakePlatform, NAMESPACE};
    use chrono::{DateTime, TimeZone};
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeSpec, PodSpec};

    const PVC_UID: &str = "aaaa1111-2222-3333-4444-555566667777";
    const POPULATE_PVC: &str = "populate-pvc-aaaa1111-2222-3333-4444-555566667777";

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn data_source_restore(name: &str, backup: &str) -> Restore {
        let mut restore = testing::restore(name, backup);
        let mut config = testing::template_config(1, VolumeClaimRestorePolicy::Parallel);
        config.data_source_ref = Some(VolumeConfig {
            volume_source: Some("data".to_string()),
            mount_path: None,
        });
        restore.spec.prepare_data_config = Some(config);
        restore
    }

    fn claim(storage_class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-mysql-0".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(PVC_UID.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage_class.map(String::from),
                data_source_ref: Some(TypedObjectReference {
                    api_group: Some("dataprotection.restore.io".to_string()),
                    kind: "Restore".to_string(),
                    name: "restore-1".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn storage_class(name: &str, provisioner: &str, binding_mode: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: provisioner.to_string(),
            volume_binding_mode: Some(binding_mode.to_string()),
            ..Default::default()
        }
    }

    fn seeded_platform() -> FakePlatform {
        let platform = FakePlatform::default();
        platform.add_backup_repo(testing::backup_repo("repo"));
        platform.add_action_set(testing::action_set("xtrabackup", true, false));
        platform.add_backup(testing::full_backup("full-1", at(1, 0)));
        platform.add_restore(data_source_restore("restore-1", "full-1"));
        platform.add_pvc(claim(None));
        platform
    }

    fn stored_claim(platform: &FakePlatform) -> PersistentVolumeClaim {
        platform.pvc(NAMESPACE, "data-mysql-0").unwrap()
    }

    async fn pass(platform: &FakePlatform, settings: &RestoreSettings) -> PopulateProgress {
        VolumePopulator::new(platform, settings)
            .reconcile(&stored_claim(platform))
            .await
            .unwrap()
    }

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn test_match_to_populate() {
        assert_eq!(
            match_to_populate(&claim(None)).unwrap().as_deref(),
            Some("restore-1")
        );

        let mut other_kind = claim(None);
        if let Some(source) = other_kind.spec.as_mut().unwrap().data_source_ref.as_mut() {
            source.kind = "VolumeSnapshot".to_string();
            source.api_group = Some("snapshot.storage.k8s.io".to_string());
        }
        assert_eq!(match_to_populate(&other_kind).unwrap(), None);

        let mut plain = claim(None);
        plain.spec.as_mut().unwrap().data_source_ref = None;
        assert_eq!(match_to_populate(&plain).unwrap(), None);

        let mut elsewhere = claim(None);
        if let Some(source) = elsewhere.spec.as_mut().unwrap().data_source_ref.as_mut() {
            source.namespace = Some("other".to_string());
        }
        let err = match_to_populate(&elsewhere).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn test_update_populating_condition() {
        let processing =
            update_populating_condition(&[], REASON_POPULATING_PROCESSING, "started").unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].type_, CONDITION_POPULATING);
        assert_eq!(processing[0].status, "True");

        // same reason is a no-op
        assert!(
            update_populating_condition(&processing, REASON_POPULATING_PROCESSING, "again")
                .is_none()
        );

        let succeeded =
            update_populating_condition(&processing, REASON_POPULATING_SUCCEED, "done").unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].reason.as_deref(), Some(REASON_POPULATING_SUCCEED));

        // a finished claim keeps its condition
        assert!(
            update_populating_condition(&succeeded, REASON_POPULATING_FAILED, "late").is_none()
        );
    }

    #[test]
    fn test_check_in_tree_provisioner() {
        let in_tree = storage_class("standard", "kubernetes.io/aws-ebs", "Immediate");
        let mut pvc = claim(Some("standard"));
        assert!(check_in_tree_provisioner(&pvc, &in_tree).unwrap_err().is_fatal());

        pvc.metadata.annotations = Some(BTreeMap::from([(
            ANN_MIGRATED_TO.to_string(),
            "ebs.csi.aws.com".to_string(),
        )]));
        assert!(check_in_tree_provisioner(&pvc, &in_tree).is_ok());

        let csi = storage_class("gp3", "ebs.csi.aws.com", "Immediate");
        assert!(check_in_tree_provisioner(&claim(Some("gp3")), &csi).is_ok());
    }

    #[tokio::test]
    async fn test_populate_and_rebind() {
        let platform = seeded_platform();
        let settings = RestoreSettings::default();

        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);

        let pvc = stored_claim(&platform);
        assert!(pvc.finalizers().iter().any(|f| f == DATA_PROTECTION_FINALIZER));
        assert_eq!(populating_reason(&pvc), Some(REASON_POPULATING_PROCESSING));

        let populate = platform.pvc(NAMESPACE, POPULATE_PVC).unwrap();
        let populate_spec = populate.spec.as_ref().unwrap();
        assert_eq!(
            populate_spec.access_modes,
            Some(vec!["ReadWriteOnce".to_string()])
        );
        assert!(populate_spec.data_source_ref.is_none());

        let task_name = format!("{}-0", POPULATE_PVC);
        assert_eq!(platform.task_names(), vec![task_name.clone()]);
        let job = platform.task(NAMESPACE, &task_name).unwrap();
        assert_eq!(
            job.labels().get(LABEL_POPULATE_PVC).map(String::as_str),
            Some(POPULATE_PVC)
        );
        let owner = &job.owner_references()[0];
        assert_eq!(owner.kind, "PersistentVolumeClaim");
        assert_eq!(owner.uid, PVC_UID);

        let spec = pod_spec(&job);
        let claim_volume = spec
            .volumes
            .iter()
            .flatten()
            .find(|v| v.name == "dp-claim")
            .unwrap();
        assert_eq!(
            claim_volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            POPULATE_PVC
        );
        let mount = spec.containers[0]
            .volume_mounts
            .iter()
            .flatten()
            .find(|m| m.name == "dp-claim")
            .unwrap();
        assert_eq!(mount.mount_path, "/var/lib/mysql");
        let tolerations = spec.tolerations.as_ref().unwrap();
        assert_eq!(tolerations[0].operator.as_deref(), Some("Exists"));
        assert!(spec.node_selector.is_none());

        // task done, populate claim not bound yet
        platform.complete_all_tasks();
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);

        platform.bind_pvc(NAMESPACE, POPULATE_PVC, "pv-1");
        platform.add_persistent_volume(PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    namespace: Some(NAMESPACE.to_string()),
                    name: Some(POPULATE_PVC.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::Populated);

        let volume = platform.persistent_volume("pv-1").unwrap();
        let claim_ref = volume.spec.unwrap().claim_ref.unwrap();
        assert_eq!(claim_ref.name.as_deref(), Some("data-mysql-0"));
        assert_eq!(claim_ref.uid.as_deref(), Some(PVC_UID));
        assert_eq!(
            volume.metadata.annotations.unwrap().get(ANN_POPULATED_FROM).map(String::as_str),
            Some("restore-1")
        );
        assert_eq!(
            populating_reason(&stored_claim(&platform)),
            Some(REASON_POPULATING_SUCCEED)
        );
        assert_eq!(platform.task_creations(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_after_bind() {
        let platform = seeded_platform();
        let settings = RestoreSettings::default();
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);
        assert!(platform.pvc(NAMESPACE, POPULATE_PVC).is_some());

        platform.bind_pvc(NAMESPACE, "data-mysql-0", "pv-1");
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::CleanedUp);

        assert!(stored_claim(&platform).finalizers().is_empty());
        assert!(platform.pvc(NAMESPACE, POPULATE_PVC).is_none());
        assert!(platform.task_names().is_empty());
        assert_eq!(platform.deleted_tasks(), vec![format!("{}-0", POPULATE_PVC)]);
    }

    #[tokio::test]
    async fn test_wait_for_first_consumer_node() {
        let platform = seeded_platform();
        let settings = RestoreSettings::default();
        platform.add_storage_class(storage_class(
            "local",
            "rancher.io/local-path",
            WAIT_FOR_FIRST_CONSUMER,
        ));
        platform.add_pvc(claim(Some("local")));

        assert_eq!(pass(&platform, &settings).await, PopulateProgress::WaitingForNode);
        assert!(platform.task_names().is_empty());
        assert!(stored_claim(&platform).finalizers().is_empty());

        let mut pvc = claim(Some("local"));
        pvc.metadata.annotations = Some(BTreeMap::from([(
            ANN_SELECTED_NODE.to_string(),
            "node-a".to_string(),
        )]));
        platform.add_pvc(pvc);
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);

        let populate = platform.pvc(NAMESPACE, POPULATE_PVC).unwrap();
        assert_eq!(
            populate.annotations().get(ANN_SELECTED_NODE).map(String::as_str),
            Some("node-a")
        );
        let job = platform.task(NAMESPACE, &format!("{}-0", POPULATE_PVC)).unwrap();
        let node_selector = pod_spec(&job).node_selector.clone().unwrap();
        assert_eq!(
            node_selector.get(HOSTNAME_LABEL).map(String::as_str),
            Some("node-a")
        );
    }

    #[tokio::test]
    async fn test_populate_from_volume_snapshot() {
        let platform = seeded_platform();
        let settings = RestoreSettings::default();
        platform.add_backup(testing::snapshot_backup("snap-1", at(1, 0)));
        platform.add_restore(data_source_restore("restore-1", "snap-1"));

        // snapshot-only backups restore through the claim alone
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);
        assert!(platform.task_names().is_empty());

        let populate = platform.pvc(NAMESPACE, POPULATE_PVC).unwrap();
        let source = populate.spec.unwrap().data_source_ref.unwrap();
        assert_eq!(source.kind, "VolumeSnapshot");
        assert_eq!(source.name, "snap-1-data");
    }

    #[tokio::test]
    async fn test_populate_failures() {
        let settings = RestoreSettings::default();

        // in-tree storage class
        let platform = seeded_platform();
        platform.add_storage_class(storage_class("standard", "kubernetes.io/gce-pd", "Immediate"));
        platform.add_pvc(claim(Some("standard")));
        let progress = pass(&platform, &settings).await;
        assert!(matches!(progress, PopulateProgress::Failed(ref m) if m.contains("in-tree")));
        assert_eq!(
            populating_reason(&stored_claim(&platform)),
            Some(REASON_POPULATING_FAILED)
        );
        // a failed claim stays failed
        assert!(matches!(
            pass(&platform, &settings).await,
            PopulateProgress::Failed(_)
        ));
        assert!(platform.task_names().is_empty());

        // restore without dataSourceRef
        let platform = seeded_platform();
        platform.add_restore(testing::restore("restore-1", "full-1"));
        let progress = pass(&platform, &settings).await;
        assert!(matches!(progress, PopulateProgress::Failed(ref m) if m.contains("dataSourceRef")));

        // failed populate task
        let platform = seeded_platform();
        assert_eq!(pass(&platform, &settings).await, PopulateProgress::InProgress);
        platform.fail_task(NAMESPACE, &format!("{}-0", POPULATE_PVC), "disk full");
        let progress = pass(&platform, &settings).await;
        assert!(matches!(progress, PopulateProgress::Failed(ref m) if m.contains("disk full")));
    }

    #[tokio::test]
    async fn test_missing_restore_waits() {
        let platform = FakePlatform::default();
        platform.add_pvc(claim(None));
        let settings = RestoreSettings::default();
        let err = VolumePopulator::new(&platform, &settings)
            .reconcile(&stored_claim(&platform))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
