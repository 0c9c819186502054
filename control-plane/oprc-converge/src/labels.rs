use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::owner::OwnerIdentity;
use crate::store::Selector;

pub const MANAGED_BY: &str = "oaas.io/managed-by";
pub const MANAGED_BY_NAME: &str = "oaas.io/managed-by-name";
pub const MANAGED_BY_NAMESPACE: &str = "oaas.io/managed-by-namespace";
pub const OWNER_UID: &str = "oaas.io/owner-uid";
pub const COMPONENT: &str = "oaas.io/component";
/// Label used by children created before the `managed-by` scheme.
pub const LEGACY_OWNER: &str = "oaas.io/owner";

/// Holds a child until its owner is gone; released by the engine.
pub const WAIT_FOR_OWNER_FINALIZER: &str = "oaas.io/wait-for-owner";

const MAX_LABEL_VALUE: usize = 63;

/// Fit `value` into a label value: at most 63 characters, ending on an
/// alphanumeric. Truncated names may collide; ownership is still decided
/// by UID (see [`owned_by`]).
pub fn label_value(value: &str) -> String {
    if value.len() <= MAX_LABEL_VALUE {
        return value.to_string();
    }
    let cut: String = value.chars().take(MAX_LABEL_VALUE).collect();
    cut.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

pub fn current_labels(
    owner: &OwnerIdentity,
    role: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY.to_string(), owner.kind.label_value().to_string()),
        (MANAGED_BY_NAME.to_string(), label_value(&owner.name)),
        (MANAGED_BY_NAMESPACE.to_string(), owner.namespace.clone()),
        (OWNER_UID.to_string(), owner.uid.clone()),
        (COMPONENT.to_string(), role.to_string()),
    ])
}

/// All current-scheme children of an owner, any role.
pub fn owner_selector(owner: &OwnerIdentity) -> Selector {
    Selector::new()
        .with(MANAGED_BY, owner.kind.label_value())
        .with(MANAGED_BY_NAME, label_value(&owner.name))
        .with(MANAGED_BY_NAMESPACE, owner.namespace.as_str())
}

pub fn current_selector(owner: &OwnerIdentity, role: &str) -> Selector {
    owner_selector(owner).with(COMPONENT, role)
}

pub fn legacy_owner_selector(owner: &OwnerIdentity) -> Selector {
    Selector::new().with(LEGACY_OWNER, label_value(&owner.name))
}

pub fn legacy_selector(owner: &OwnerIdentity, role: &str) -> Selector {
    legacy_owner_selector(owner).with(COMPONENT, role)
}

/// A child is legacy when it lacks the current owner-name label.
pub fn is_legacy(meta: &ObjectMeta) -> bool {
    !meta
        .labels
        .as_ref()
        .map(|l| l.contains_key(MANAGED_BY_NAME))
        .unwrap_or(false)
}

/// Back-reference check by owner reference or the owner-uid label.
pub fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    let by_ref = meta
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == uid))
        .unwrap_or(false);
    let by_label = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(OWNER_UID))
        .map(|v| v == uid)
        .unwrap_or(false);
    by_ref || by_label
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == finalizer))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::OwnerKind;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner() -> OwnerIdentity {
        OwnerIdentity {
            kind: OwnerKind::DataPlane,
            namespace: "ns".into(),
            name: "edge".into(),
            uid: "u-1".into(),
            generation: 1,
        }
    }

    #[test]
    fn current_labels_match_current_selector() {
        let labels = current_labels(&owner(), "proxy");
        assert!(current_selector(&owner(), "proxy").matches(Some(&labels)));
        assert!(!current_selector(&owner(), "tls").matches(Some(&labels)));
        assert!(!legacy_selector(&owner(), "proxy").matches(Some(&labels)));
        assert_eq!(labels[MANAGED_BY], "dataplane");
    }

    #[test]
    fn long_owner_names_fit_label_values() {
        let mut long = owner();
        long.name = format!("{}.{}", "a".repeat(62), "b".repeat(40));
        let labels = current_labels(&long, "proxy");
        let value = &labels[MANAGED_BY_NAME];
        assert_eq!(value, &"a".repeat(62));
        assert!(current_selector(&long, "proxy").matches(Some(&labels)));

        let exact = "c".repeat(63);
        assert_eq!(label_value(&exact), exact);
        assert_eq!(label_value("edge"), "edge");
    }

    #[test]
    fn legacy_detection() {
        let mut meta = ObjectMeta::default();
        assert!(is_legacy(&meta));
        meta.labels = Some(BTreeMap::from([
            (LEGACY_OWNER.to_string(), "edge".to_string()),
            (COMPONENT.to_string(), "proxy".to_string()),
        ]));
        assert!(is_legacy(&meta));
        meta.labels = Some(current_labels(&owner(), "proxy"));
        assert!(!is_legacy(&meta));
    }

    #[test]
    fn ownership_by_reference_or_label() {
        let mut meta = ObjectMeta::default();
        assert!(!owned_by(&meta, "u-1"));
        meta.owner_references = Some(vec![OwnerReference {
            uid: "u-1".into(),
            ..Default::default()
        }]);
        assert!(owned_by(&meta, "u-1"));
        assert!(!owned_by(&meta, "u-2"));

        let mut meta = ObjectMeta::default();
        meta.labels = Some(BTreeMap::from([(
            OWNER_UID.to_string(),
            "u-2".to_string(),
        )]));
        assert!(owned_by(&meta, "u-2"));
    }
}
