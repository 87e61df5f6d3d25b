/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/modules/rbac_manager/src/conditions.rs
*
* Helpers for the status condition set carried by every template. Conditions
* are recomputed on each reconciliation and merged into the previous set so
* that `lastTransitionTime` only moves when the status actually flips.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::StatusCondition;
use chrono::Utc;

pub const CREATED: &str = "Created";
pub const ROLE_REFS_VALID: &str = "RoleRefsValid";
pub const VALID: &str = "Valid";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Builds a condition stamped with the current time.
pub fn condition(
    type_: &str,
    status: impl Into<ConditionStatus>,
    reason: &str,
    message: impl Into<String>,
) -> StatusCondition {
    StatusCondition {
        type_: type_.to_string(),
        status: status.into().as_str().to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: Utc::now().to_rfc3339(),
    }
}

/// Inserts or replaces the condition of the same type. The previous transition
/// time is kept when the status did not change.
pub fn set_condition(conditions: &mut Vec<StatusCondition>, mut new: StatusCondition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

/// Merges a freshly computed set into the previous one.
pub fn merge_conditions(
    previous: &[StatusCondition],
    computed: Vec<StatusCondition>,
) -> Vec<StatusCondition> {
    let mut merged = previous.to_vec();
    for c in computed {
        set_condition(&mut merged, c);
    }
    merged
}

pub fn find_condition<'a>(conditions: &'a [StatusCondition], type_: &str) -> Option<&'a StatusCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[StatusCondition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![StatusCondition {
            type_: CREATED.to_string(),
            status: "True".to_string(),
            reason: "Reconciled".to_string(),
            message: "old".to_string(),
            last_transition_time: "2025-01-01T00:00:00+00:00".to_string(),
        }];

        set_condition(&mut conditions, condition(CREATED, true, "Reconciled", "new"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "new");
        assert_eq!(conditions[0].last_transition_time, "2025-01-01T00:00:00+00:00");

        set_condition(&mut conditions, condition(CREATED, false, "Failed", "boom"));
        assert_eq!(conditions[0].status, "False");
        assert_ne!(conditions[0].last_transition_time, "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_conditions_transition_in_both_directions() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, condition(ROLE_REFS_VALID, false, "RoleNotFound", "missing"));
        assert!(!is_true(&conditions, ROLE_REFS_VALID));
        set_condition(&mut conditions, condition(ROLE_REFS_VALID, true, "AllRolesFound", ""));
        assert!(is_true(&conditions, ROLE_REFS_VALID));
        set_condition(&mut conditions, condition(ROLE_REFS_VALID, false, "RoleNotFound", "gone"));
        assert!(!is_true(&conditions, ROLE_REFS_VALID));
    }

    #[test]
    fn test_merge_conditions_adds_new_types() {
        let previous = vec![condition(CREATED, true, "Reconciled", "")];
        let merged = merge_conditions(
            &previous,
            vec![condition(ROLE_REFS_VALID, ConditionStatus::Unknown, "Pending", "")],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(find_condition(&merged, ROLE_REFS_VALID).unwrap().status, "Unknown");
    }
}
