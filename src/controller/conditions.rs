//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Ready, Progressing=False, Degraded=False after a successful reconciliation
pub fn mark_succeeded(conditions: &mut Vec<Condition>, reason: &str, message: &str, generation: Option<i64>) {
    set_condition(conditions, CONDITION_TYPE_READY, CONDITION_STATUS_TRUE, reason, message, generation);
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        CONDITION_STATUS_FALSE,
        reason,
        message,
        generation,
    );
    set_condition(
        conditions,
        CONDITION_TYPE_DEGRADED,
        CONDITION_STATUS_FALSE,
        "NoIssues",
        "No degradation detected",
        generation,
    );
}

/// Ready=False and Degraded=True; Progressing stays True while a retry is pending
pub fn mark_failed(
    conditions: &mut Vec<Condition>,
    reason: &str,
    message: &str,
    retryable: bool,
    generation: Option<i64>,
) {
    set_condition(conditions, CONDITION_TYPE_READY, CONDITION_STATUS_FALSE, reason, message, generation);
    let progressing = if retryable {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    let progressing_reason = if retryable { "RetryScheduled" } else { reason };
    set_condition(
        conditions,
        CONDITION_TYPE_PROGRESSING,
        progressing,
        progressing_reason,
        message,
        generation,
    );
    set_condition(conditions, CONDITION_TYPE_DEGRADED, CONDITION_STATUS_TRUE, reason, message, generation);
}
