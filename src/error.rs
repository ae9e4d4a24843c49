//! Error types for the restore operator
//!
//! Errors fall into two families that drive reconciliation: fatal errors end a
//! restore in the `Failed` phase and are never retried, everything else makes
//! the controller requeue the restore and try again later.

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
    /// Invalid resource state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Non-retryable failure; the restore transitions to `Failed`
    #[error("{0}")]
    Fatal(String),
    /// Expected during normal progress; the caller re-invokes later
    #[error("waiting: {0}")]
    NeedsWaiting(String),
}

impl OperatorError {
    /// Build a fatal error from anything displayable
    pub fn fatal(msg: impl Into<String>) -> Self {
        OperatorError::Fatal(msg.into())
    }

    /// Build a needs-waiting signal
    pub fn waiting(msg: impl Into<String>) -> Self {
        OperatorError::NeedsWaiting(msg.into())
    }

    /// Fatal errors are surfaced in the restore status and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OperatorError::Fatal(_))
    }

    /// Transient errors only cause a requeue and are not reported as failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, OperatorError::NeedsWaiting(_))
    }

    /// Promote a not-found error into a fatal one.
    ///
    /// Used while walking backup lineage: a missing ancestor cannot be
    /// synthesized, so retrying would never succeed.
    pub fn promote_not_found(self) -> Self {
        match self {
            OperatorError::NotFound(msg) => OperatorError::Fatal(msg),
            other => other,
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message.clone()),
            // stale resourceVersion; re-read and retry
            kube::Error::Api(ae) if ae.code == 409 => {
                OperatorError::NeedsWaiting(format!("conflict: {}", ae.message))
            }
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));

        let err = OperatorError::fatal(r#"backup "b1" not found"#);
        assert_eq!(err.to_string(), r#"backup "b1" not found"#);
    }

    #[test]
    fn test_error_classification() {
        assert!(OperatorError::fatal("x").is_fatal());
        assert!(!OperatorError::fatal("x").is_transient());
        assert!(OperatorError::waiting("job running").is_transient());
        assert!(!OperatorError::KubeApi("boom".into()).is_fatal());
        assert!(!OperatorError::KubeApi("boom".into()).is_transient());
    }

    #[test]
    fn test_promote_not_found() {
        let err = OperatorError::NotFound("backup b0".into()).promote_not_found();
        assert!(err.is_fatal());

        let err = OperatorError::KubeApi("timeout".into()).promote_not_found();
        assert!(!err.is_fatal());
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("restores.dataprotection.restore.io \"restore-1\": {}", reason),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_from_kube_error() {
        let err = OperatorError::from(api_error(404, "NotFound"));
        assert!(matches!(err, OperatorError::NotFound(_)));

        // status written against a stale resourceVersion is retried quietly
        let err = OperatorError::from(api_error(409, "Conflict"));
        assert!(err.is_transient());
        assert!(!err.is_fatal());

        let err = OperatorError::from(api_error(500, "InternalError"));
        assert!(matches!(err, OperatorError::KubeApi(_)));
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            OperatorError::KubeApi("api".to_string()),
            OperatorError::Configuration("config".to_string()),
            OperatorError::Reconciliation("reconcile".to_string()),
            OperatorError::Serialization("serde".to_string()),
            OperatorError::NotFound("resource".to_string()),
            OperatorError::InvalidState("state".to_string()),
            OperatorError::Fatal("fatal".to_string()),
            OperatorError::NeedsWaiting("wait".to_string()),
        ];

        for err in errors {
            let _ = format!("{}", err);
        }
    }
}
