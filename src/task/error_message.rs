//! Error payload normalization.
//!
//! Failure payloads arrive in several shapes depending on who produced them:
//! lane handlers nest an `error` object, lifecycle events carry flat
//! `errorCode`/`errorMessage` fields, and older producers put a bare string
//! under `error`. This module flattens all of them into one summary and
//! classifies user cancellation so callers can render it as a non-error.

use serde_json::Value;

use crate::task::model::{as_non_empty_string, as_object};

/// Flattened error extracted from a terminal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskErrorSummary {
    pub code: Option<String>,
    pub message: String,
    pub cancelled: bool,
}

/// Codes with a stable user-facing message.
fn user_message_for_code(code: &str) -> Option<&'static str> {
    match code {
        "INSUFFICIENT_BALANCE" => Some("Insufficient balance, please top up and retry"),
        "INVALID_PARAMS" => Some("Request parameters were invalid"),
        "ENQUEUE_FAILED" => Some("Task could not be queued, please retry"),
        "RECONCILE_ORPHAN" => Some("Task was lost by the queue and has been rolled back"),
        "WATCHDOG_TIMEOUT" => Some("Task timed out without reporting progress"),
        "HANDLER_MISSING" => Some("No handler is registered for this task type"),
        "INTERNAL_ERROR" => Some("Internal error, please retry later"),
        _ => None,
    }
}

fn looks_cancelled_message(value: Option<&str>) -> bool {
    let Some(value) = value else { return false };
    let lower = value.to_lowercase();
    lower.contains("task cancelled")
        || lower.contains("task canceled")
        || lower.contains("cancelled by user")
        || lower.contains("canceled by user")
        || lower.contains("任务已取消")
}

fn flag(map: Option<&serde_json::Map<String, Value>>, key: &str) -> bool {
    map.and_then(|m| m.get(key)).and_then(Value::as_bool) == Some(true)
}

/// Extract `{code, message, cancelled}` from an arbitrary failure payload.
///
/// Cancellation wins over everything else: a cancelled task always reports
/// `cancelled: true` with a fixed message, regardless of what else the
/// payload carries.
pub fn resolve_task_error_summary(payload: &Value, fallback_message: &str) -> TaskErrorSummary {
    let source = as_object(payload);
    let get = |key: &str| source.and_then(|m| m.get(key));

    let error_obj = get("error").and_then(as_object);
    let error_details = error_obj.and_then(|m| m.get("details")).and_then(as_object);
    let details_obj = get("details").and_then(as_object);

    let code = as_non_empty_string(error_obj.and_then(|m| m.get("code")))
        .or_else(|| as_non_empty_string(get("errorCode")))
        .or_else(|| as_non_empty_string(get("code")));

    let message = as_non_empty_string(error_obj.and_then(|m| m.get("message")))
        .or_else(|| as_non_empty_string(error_details.and_then(|m| m.get("message"))))
        .or_else(|| as_non_empty_string(get("error")))
        .or_else(|| as_non_empty_string(details_obj.and_then(|m| m.get("message"))))
        .or_else(|| as_non_empty_string(get("details")))
        .or_else(|| as_non_empty_string(get("errorMessage")))
        .or_else(|| as_non_empty_string(get("message")));

    let stage = as_non_empty_string(get("stage"));

    let cancelled = flag(source, "cancelled")
        || flag(source, "canceled")
        || flag(error_obj, "cancelled")
        || flag(error_obj, "canceled")
        || flag(error_details, "cancelled")
        || flag(error_details, "canceled")
        || stage.as_deref() == Some("cancelled")
        || code.as_deref() == Some("TASK_CANCELLED")
        || looks_cancelled_message(message.as_deref());

    if cancelled {
        return TaskErrorSummary {
            code: Some(code.unwrap_or_else(|| "TASK_CANCELLED".to_string())),
            message: "Task cancelled by user".to_string(),
            cancelled: true,
        };
    }

    let user_friendly = code.as_deref().and_then(user_message_for_code);

    TaskErrorSummary {
        message: message
            .or_else(|| user_friendly.map(String::from))
            .unwrap_or_else(|| fallback_message.to_string()),
        code,
        cancelled: false,
    }
}

/// Message-only shorthand used by event publishers.
pub fn resolve_task_error_message(payload: &Value, fallback_message: &str) -> String {
    resolve_task_error_summary(payload, fallback_message).message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_error_object_wins() {
        let summary = resolve_task_error_summary(
            &json!({"error": {"code": "INVALID_PARAMS", "message": "bad prompt"}}),
            "Task failed",
        );
        assert_eq!(summary.code.as_deref(), Some("INVALID_PARAMS"));
        assert_eq!(summary.message, "bad prompt");
        assert!(!summary.cancelled);
    }

    #[test]
    fn flat_fields_are_picked_up() {
        let summary = resolve_task_error_summary(
            &json!({"errorCode": "ENQUEUE_FAILED", "errorMessage": "lane closed"}),
            "Task failed",
        );
        assert_eq!(summary.code.as_deref(), Some("ENQUEUE_FAILED"));
        assert_eq!(summary.message, "lane closed");
    }

    #[test]
    fn bare_error_string_becomes_message() {
        let summary = resolve_task_error_summary(&json!({"error": "gpu exploded"}), "Task failed");
        assert_eq!(summary.code, None);
        assert_eq!(summary.message, "gpu exploded");
    }

    #[test]
    fn known_code_without_message_uses_user_message() {
        let summary =
            resolve_task_error_summary(&json!({"code": "INSUFFICIENT_BALANCE"}), "Task failed");
        assert_eq!(summary.message, "Insufficient balance, please top up and retry");
    }

    #[test]
    fn empty_payload_falls_back() {
        let summary = resolve_task_error_summary(&json!({}), "Task failed");
        assert_eq!(summary.code, None);
        assert_eq!(summary.message, "Task failed");
        assert!(!summary.cancelled);

        let non_object = resolve_task_error_summary(&json!("oops"), "Task failed");
        assert_eq!(non_object.message, "Task failed");
    }

    #[test]
    fn cancellation_detected_by_code_stage_flag_and_wording() {
        for payload in [
            json!({"code": "TASK_CANCELLED"}),
            json!({"stage": "cancelled"}),
            json!({"cancelled": true}),
            json!({"error": {"canceled": true}}),
            json!({"message": "Task cancelled by user"}),
            json!({"message": "任务已取消"}),
        ] {
            let summary = resolve_task_error_summary(&payload, "Task failed");
            assert!(summary.cancelled, "payload should classify as cancelled: {payload}");
            assert_eq!(summary.message, "Task cancelled by user");
        }
    }

    #[test]
    fn cancelled_string_flag_is_ignored() {
        // Only `true` counts, not truthy strings.
        let summary = resolve_task_error_summary(&json!({"cancelled": "yes"}), "Task failed");
        assert!(!summary.cancelled);
    }
}
