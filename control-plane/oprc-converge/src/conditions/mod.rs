//! Condition bookkeeping on owner status.
//!
//! Conditions are unique by type and kept in a stable order: the aggregate
//! (`Ready`/`Programmed`) first, then the rest by type name.
//! `lastTransitionTime` moves only when status, reason or message change.

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

pub const READY: &str = "Ready";
pub const PROGRAMMED: &str = "Programmed";

pub const CERTIFICATE_PROVISIONED: &str = "CertificateProvisioned";
pub const SERVICE_READY: &str = "ServiceReady";
pub const WORKLOAD_AVAILABLE: &str = "WorkloadAvailable";
pub const RBAC_PROVISIONED: &str = "RBACProvisioned";
pub const WEBHOOK_CONFIGURED: &str = "WebhookConfigured";
pub const DATA_PLANE_RESOLVED: &str = "DataPlaneResolved";
pub const DATA_PLANE_READY: &str = "DataPlaneReady";
pub const CONTROL_PLANE_READY: &str = "ControlPlaneReady";

fn is_aggregate(type_: &str) -> bool {
    type_ == READY || type_ == PROGRAMMED
}

fn rank(type_: &str) -> (u8, &str) {
    (if is_aggregate(type_) { 0 } else { 1 }, type_)
}

pub fn new_condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: &str,
    generation: i64,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: ConditionStatus::from_bool(ok),
        reason: Some(reason.to_string()),
        message: (!message.is_empty()).then(|| message.to_string()),
        observed_generation: Some(generation),
        last_transition_time: None,
    }
}

pub fn find<'a>(list: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    list.iter().find(|c| c.type_ == type_)
}

pub fn is_true(list: &[Condition], type_: &str) -> bool {
    find(list, type_)
        .map(|c| c.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Insert or update `new`; returns whether the list changed.
pub fn set_condition(list: &mut Vec<Condition>, mut new: Condition) -> bool {
    let changed = match list.iter_mut().find(|c| c.type_ == new.type_) {
        None => {
            new.last_transition_time = Some(Utc::now().to_rfc3339());
            list.push(new);
            true
        }
        Some(cur) => {
            if cur.status != new.status
                || cur.reason != new.reason
                || cur.message != new.message
            {
                new.last_transition_time = Some(Utc::now().to_rfc3339());
                *cur = new;
                true
            } else if cur.observed_generation != new.observed_generation {
                cur.observed_generation = new.observed_generation;
                true
            } else {
                false
            }
        }
    };
    if changed {
        list.sort_by(|a, b| rank(&a.type_).cmp(&rank(&b.type_)));
    }
    changed
}

pub fn remove_condition(list: &mut Vec<Condition>, type_: &str) -> bool {
    let before = list.len();
    list.retain(|c| c.type_ != type_);
    before != list.len()
}

pub fn is_stale(condition: &Condition, generation: i64) -> bool {
    condition.observed_generation != Some(generation)
}

/// True iff every non-aggregate condition is `True` for `generation`.
pub fn aggregate_ready(list: &[Condition], generation: i64) -> bool {
    let mut parts = list.iter().filter(|c| !is_aggregate(&c.type_)).peekable();
    if parts.peek().is_none() {
        return false;
    }
    parts.all(|c| {
        c.status == ConditionStatus::True && !is_stale(c, generation)
    })
}

/// Types of the non-aggregate conditions that hold readiness back.
pub fn blocking(list: &[Condition], generation: i64) -> Vec<String> {
    list.iter()
        .filter(|c| !is_aggregate(&c.type_))
        .filter(|c| {
            c.status != ConditionStatus::True || is_stale(c, generation)
        })
        .map(|c| c.type_.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_stamps_transition_time() {
        let mut list = vec![];
        assert!(set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 1)
        ));
        assert_eq!(list.len(), 1);
        assert!(list[0].last_transition_time.is_some());
    }

    #[test]
    fn identical_condition_is_noop() {
        let mut list = vec![];
        set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 1),
        );
        let before = list.clone();
        assert!(!set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 1)
        ));
        assert_eq!(list, before);
    }

    #[test]
    fn generation_bump_keeps_transition_time() {
        let mut list = vec![];
        set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 1),
        );
        list[0].last_transition_time = Some("2020-01-01T00:00:00Z".into());
        assert!(set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 2)
        ));
        assert_eq!(list[0].observed_generation, Some(2));
        assert_eq!(
            list[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
    }

    #[test]
    fn status_change_moves_transition_time() {
        let mut list = vec![];
        set_condition(
            &mut list,
            new_condition(SERVICE_READY, true, "Available", "", 1),
        );
        list[0].last_transition_time = Some("2020-01-01T00:00:00Z".into());
        assert!(set_condition(
            &mut list,
            new_condition(SERVICE_READY, false, "NoEndpoints", "", 1)
        ));
        assert_ne!(
            list[0].last_transition_time.as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
        assert_eq!(list[0].status, ConditionStatus::False);
    }

    #[test]
    fn order_is_stable() {
        let mut list = vec![];
        for t in [WORKLOAD_AVAILABLE, READY, CERTIFICATE_PROVISIONED] {
            set_condition(&mut list, new_condition(t, true, "Ok", "", 1));
        }
        let types: Vec<&str> = list.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, [READY, CERTIFICATE_PROVISIONED, WORKLOAD_AVAILABLE]);
    }

    #[test]
    fn stale_condition_blocks_ready() {
        // Owner at generation 5: ServiceReady was last evaluated at 4.
        let list = vec![
            new_condition(SERVICE_READY, true, "Available", "", 4),
            new_condition(WORKLOAD_AVAILABLE, true, "Available", "", 5),
        ];
        assert!(!aggregate_ready(&list, 5));
        assert_eq!(blocking(&list, 5), vec![SERVICE_READY.to_string()]);
        assert!(aggregate_ready(&list[1..], 5));
    }

    #[test]
    fn aggregate_ignores_itself_and_needs_parts() {
        let list = vec![new_condition(READY, false, "Pending", "", 1)];
        assert!(!aggregate_ready(&list, 1));
        let list = vec![
            new_condition(READY, false, "Pending", "", 1),
            new_condition(SERVICE_READY, true, "Available", "", 1),
        ];
        assert!(aggregate_ready(&list, 1));
    }

    #[test]
    fn remove_drops_type() {
        let mut list =
            vec![new_condition(WEBHOOK_CONFIGURED, true, "Ok", "", 1)];
        assert!(remove_condition(&mut list, WEBHOOK_CONFIGURED));
        assert!(!remove_condition(&mut list, WEBHOOK_CONFIGURED));
    }
}
