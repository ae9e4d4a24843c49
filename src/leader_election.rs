//! Kubernetes Lease-based leader election for HA operator deployments.
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease runs the restore
//! controller. Standby replicas block in [`LeaderElector::acquire`] until
//! the current holder releases the lease or stops renewing it.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Detects the namespace holding the lease.
///
/// Priority: explicit argument, then the service account namespace, then
/// `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

/// Timing and naming of the lease
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub name: String,
    pub duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            name: "restore-operator-leader".to_string(),
            duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl LeaseSettings {
    fn duration_seconds(&self) -> i32 {
        i32::try_from(self.duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// Whether a lease is free to take: never renewed, or not renewed within
/// its duration.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>, default_seconds: i32) -> bool {
    let Some(MicroTime(renewed)) = spec.and_then(|s| s.renew_time.as_ref()) else {
        return true;
    };
    let seconds = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(default_seconds);
    now.signed_duration_since(*renewed).num_seconds() > i64::from(seconds)
}

/// Spec claiming the lease for `identity`. Taking the lease over from
/// another holder resets the acquire time and counts a transition.
pub fn claimed_spec(
    previous: Option<&LeaseSpec>,
    identity: &str,
    now: DateTime<Utc>,
    duration_seconds: i32,
) -> LeaseSpec {
    let held = previous.and_then(|s| s.holder_identity.as_deref()) == Some(identity);
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    let now = MicroTime(now);

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(duration_seconds),
        acquire_time: if held {
            previous.and_then(|s| s.acquire_time.clone())
        } else {
            Some(now.clone())
        },
        renew_time: Some(now),
        lease_transitions: Some(match previous {
            Some(_) if !held => transitions + 1,
            _ => transitions,
        }),
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

/// Lease-based leader election.
///
/// Writes go through `replace` with the lease's `resourceVersion`, so two
/// replicas racing for the lease cannot both win.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    settings: LeaseSettings,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, settings: LeaseSettings) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("restore-operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %settings.name, "Initialized leader elector");
        Self {
            lease_api,
            identity,
            settings,
        }
    }

    /// Blocks until the lease is acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", self.settings.name);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lease held by another instance, retrying in {:?}", self.settings.retry_interval);
                }
                Err(e) => {
                    warn!("Lease acquisition error: {}, retrying in {:?}", e, self.settings.retry_interval);
                }
            }
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    /// Renews the lease. Returns `Ok(false)` once leadership is lost.
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(&self.settings.name).await?;
        let spec = lease.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_deref()) != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease.clone();
        updated.spec = Some(claimed_spec(
            spec,
            &self.identity,
            Utc::now(),
            self.settings.duration_seconds(),
        ));
        match self.replace(&updated).await {
            Ok(()) => {
                debug!("Renewed leader lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                warn!("Lease conflict during renewal, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew the lease until leadership is lost or renewal fails.
    pub async fn hold(&self) {
        loop {
            tokio::time::sleep(self.settings.renew_interval).await;
            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Lost leader lease");
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, "Failed to renew leader lease: {}", e);
                    return;
                }
            }
        }
    }

    /// Releases the lease by clearing the holder identity.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(&self.settings.name).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };
        let holder = lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease.clone();
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.replace(&updated).await {
            Ok(()) => info!(identity = %self.identity, "Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    async fn replace(&self, lease: &Lease) -> std::result::Result<(), kube::Error> {
        self.lease_api
            .replace(&self.settings.name, &PostParams::default(), lease)
            .await
            .map(|_| ())
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = match self.lease_api.get(&self.settings.name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return self.create_lease(now).await,
            Err(e) => return Err(e.into()),
        };

        let spec = existing.spec.as_ref();
        let held = spec.and_then(|s| s.holder_identity.as_deref()) == Some(self.identity.as_str());
        let vacant = spec.and_then(|s| s.holder_identity.as_deref()).is_none();
        if !held && !vacant && !lease_expired(spec, now, self.settings.duration_seconds()) {
            return Ok(false);
        }

        let mut updated = existing.clone();
        updated.spec = Some(claimed_spec(
            spec,
            &self.identity,
            now,
            self.settings.duration_seconds(),
        ));
        match self.replace(&updated).await {
            Ok(()) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.settings.name.clone()),
                ..Default::default()
            },
            spec: Some(claimed_spec(
                None,
                &self.identity,
                now,
                self.settings.duration_seconds(),
            )),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(OperatorError::from(e)),
        }
    }
}
