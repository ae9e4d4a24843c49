//! Operator configuration
//!
//! Command-line flags (each also readable from the environment) and the
//! immutable settings derived from them that the restore engine consumes.

use clap::Parser;
use std::time::Duration;

/// Restore Kubernetes Operator
#[derive(Parser, Debug, Clone)]
#[command(name = "restore-operator")]
#[command(version, about = "Kubernetes Operator orchestrating restores from backups")]
pub struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, env = "RESTORE_LEADER_ELECTION", default_value = "false")]
    pub leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "RESTORE_LEADER_ELECTION_NAMESPACE", default_value = "")]
    pub leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "RESTORE_WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Namespace the operator runs in; exec-style post-ready tasks are created here
    #[arg(long, env = "POD_NAMESPACE", default_value = "restore-system")]
    pub operator_namespace: String,

    /// Image providing kubectl, used for exec actions
    #[arg(long, env = "RESTORE_TOOLS_IMAGE", default_value = "bitnami/kubectl:1.30")]
    pub tools_image: String,

    /// Service account used by tasks created in the operator namespace
    #[arg(long, env = "RESTORE_SERVICE_ACCOUNT", default_value = "restore-operator")]
    pub service_account_name: String,

    /// Seconds between polls of in-flight restores
    #[arg(long, env = "RESTORE_REQUEUE_SECONDS", default_value = "10")]
    pub requeue_seconds: u64,

    /// Retries of a failing restore task before it is marked failed
    #[arg(long, env = "RESTORE_TASK_BACKOFF_LIMIT", default_value = "3")]
    pub task_backoff_limit: i32,
}

/// Settings shared by every reconciliation pass
#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub operator_namespace: String,
    pub tools_image: String,
    pub operator_service_account: String,
    pub requeue_interval: Duration,
    pub task_backoff_limit: i32,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            operator_namespace: "restore-system".to_string(),
            tools_image: "bitnami/kubectl:1.30".to_string(),
            operator_service_account: "restore-operator".to_string(),
            requeue_interval: Duration::from_secs(10),
            task_backoff_limit: 3,
        }
    }
}

impl From<&Args> for RestoreSettings {
    fn from(args: &Args) -> Self {
        Self {
            operator_namespace: args.operator_namespace.clone(),
            tools_image: args.tools_image.clone(),
            operator_service_account: args.service_account_name.clone(),
            requeue_interval: Duration::from_secs(args.requeue_seconds.max(1)),
            task_backoff_limit: args.task_backoff_limit.max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["restore-operator"]);
        assert!(!args.leader_election);
        assert_eq!(args.requeue_seconds, 10);

        let settings = RestoreSettings::from(&args);
        assert_eq!(settings.requeue_interval, Duration::from_secs(10));
        assert_eq!(settings.task_backoff_limit, 3);
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "restore-operator",
            "--operator-namespace",
            "dp-system",
            "--tools-image",
            "tools:1.0",
            "--requeue-seconds",
            "0",
        ]);
        let settings = RestoreSettings::from(&args);
        assert_eq!(settings.operator_namespace, "dp-system");
        assert_eq!(settings.tools_image, "tools:1.0");
        // clamped to at least one second
        assert_eq!(settings.requeue_interval, Duration::from_secs(1));
    }
}
