//! Cluster API style conditions
//!
//! Conditions are kept as an ordered set keyed by type: `Ready` first, the rest sorted
//! by type. Re-setting a condition with an unchanged status keeps its
//! `lastTransitionTime`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting overall readiness
pub const READY_CONDITION: &str = "Ready";

/// Condition type reporting whether the provider ID was stamped onto the workload node
pub const PROVIDER_SET_CONDITION: &str = "ProviderSet";

/// Reason used when the workload node could not be updated
pub const PROVIDER_UPDATE_FAILED_REASON: &str = "ProviderUpdateFailed";

/// Condition status values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

/// How severe a `False` condition is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// Requires operator attention
    Error,
    /// Degraded but expected to recover
    Warning,
    /// Informational
    Info,
}

/// A single observed condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "Ready", "ProviderSet")
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// Severity, only meaningful when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A `True` condition of the given type
    pub fn true_condition(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// A `False` condition with reason, severity and message
    pub fn false_condition(
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(Utc::now()),
        }
    }

    fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Look up a condition by type
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is present and `True`
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or replace a condition, keeping the set ordered.
///
/// An unchanged condition is left untouched so repeated reconciles do not churn
/// `lastTransitionTime`; a status-preserving change keeps the old transition time.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.same_state(&condition) {
            return;
        }
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
    conditions.sort_by(|a, b| {
        let rank = |c: &Condition| u8::from(c.type_ != READY_CONDITION);
        rank(a).cmp(&rank(b)).then_with(|| a.type_.cmp(&b.type_))
    });
}

/// Mark a condition `True`
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(conditions, Condition::true_condition(type_));
}

/// Mark a condition `False`
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set(conditions, Condition::false_condition(type_, reason, severity, message));
}
