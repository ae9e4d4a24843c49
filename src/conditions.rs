//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for managing the conditions of a
//! Restore following the Kubernetes API conventions.

use crate::crd::{RestoreCondition, RestoreStage};
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Restore condition types
pub const CONDITION_VALIDATION_PASSED: &str = "ValidationPassed";
pub const CONDITION_PREPARED_DATA: &str = "PrepareData";
pub const CONDITION_READINESS_PROBE: &str = "ReadinessProbe";
pub const CONDITION_POST_READY: &str = "PostReady";

// Condition reasons
pub const REASON_VALIDATE_SUCCESSFULLY: &str = "ValidateSuccessfully";
pub const REASON_VALIDATE_FAILED: &str = "ValidateFailed";
pub const REASON_PROCESSING: &str = "Processing";
pub const REASON_SUCCEED: &str = "Succeed";
pub const REASON_FAILED: &str = "Failed";

// Claim condition tracking volume population
pub const CONDITION_POPULATING: &str = "Populating";
pub const REASON_POPULATING_PROCESSING: &str = "PopulatingProcessing";
pub const REASON_POPULATING_SUCCEED: &str = "PopulatingSucceed";
pub const REASON_POPULATING_FAILED: &str = "PopulatingFailed";

/// Finalizer placed on restores, the tasks they own and claims being populated
pub const DATA_PROTECTION_FINALIZER: &str = "dataprotection.restore.io/finalizer";

/// Condition type tracking a restore stage.
pub fn stage_condition_type(stage: RestoreStage) -> &'static str {
    match stage {
        RestoreStage::PrepareData => CONDITION_PREPARED_DATA,
        RestoreStage::PostReady => CONDITION_POST_READY,
    }
}

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> RestoreCondition {
    RestoreCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Status value for a reason: succeeded stages are `True`, failed ones `False`,
/// anything still in flight `Unknown`.
pub fn status_for_reason(reason: &str) -> &'static str {
    match reason {
        REASON_SUCCEED | REASON_VALIDATE_SUCCESSFULLY => CONDITION_TRUE,
        REASON_FAILED | REASON_VALIDATE_FAILED => CONDITION_FALSE,
        _ => CONDITION_UNKNOWN,
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<RestoreCondition>, new: RestoreCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

pub fn find_condition<'a>(
    conditions: &'a [RestoreCondition],
    condition_type: &str,
) -> Option<&'a RestoreCondition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

pub fn is_condition_true(conditions: &[RestoreCondition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(
            CONDITION_PREPARED_DATA,
            CONDITION_TRUE,
            REASON_SUCCEED,
            "prepare data successfully",
        );
        assert_eq!(cond.r#type, "PrepareData");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("Succeed"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            build_condition("Ready", CONDITION_TRUE, "OK", "ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert!(is_condition_true(&conditions, "Ready"));
        assert!(!is_condition_true(&conditions, "Other"));
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![RestoreCondition {
            r#type: CONDITION_PREPARED_DATA.to_string(),
            status: CONDITION_UNKNOWN.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some(REASON_PROCESSING.to_string()),
            message: Some("first".to_string()),
        }];

        set_condition(
            &mut conditions,
            build_condition(CONDITION_PREPARED_DATA, CONDITION_UNKNOWN, REASON_PROCESSING, "second"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![RestoreCondition {
            r#type: CONDITION_POST_READY.to_string(),
            status: CONDITION_UNKNOWN.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some(REASON_PROCESSING.to_string()),
            message: None,
        }];

        set_condition(
            &mut conditions,
            build_condition(CONDITION_POST_READY, CONDITION_TRUE, REASON_SUCCEED, "done"),
        );

        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_status_for_reason() {
        assert_eq!(status_for_reason(REASON_SUCCEED), CONDITION_TRUE);
        assert_eq!(status_for_reason(REASON_VALIDATE_FAILED), CONDITION_FALSE);
        assert_eq!(status_for_reason(REASON_PROCESSING), CONDITION_UNKNOWN);
    }

    #[test]
    fn test_stage_condition_type() {
        assert_eq!(stage_condition_type(RestoreStage::PrepareData), "PrepareData");
        assert_eq!(stage_condition_type(RestoreStage::PostReady), "PostReady");
    }
}
