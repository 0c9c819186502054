//! Desired child objects derived from owner specs.
//!
//! Everything here is pure: the same owner state always renders the same
//! objects (sorted maps, no timestamps, no generated names), which is what
//! lets the applier decide "no change" by comparison alone.

pub mod controlplane;
pub mod dataplane;
pub mod gateway;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::{ConvergeError, invalid_spec};
use crate::labels::{WAIT_FOR_OWNER_FINALIZER, current_labels};
use crate::owner::OwnerIdentity;
use crate::registry::TypeRegistry;

pub const ROLE_TLS: &str = "tls";
pub const ROLE_PROXY: &str = "proxy";
pub const ROLE_CONTROLLER: &str = "controller";
pub const ROLE_WEBHOOK: &str = "webhook";
pub const ROLE_DATAPLANE: &str = "dataplane";
pub const ROLE_CONTROLPLANE: &str = "controlplane";

/// Pod-template annotation listing the owner's extension references.
pub const EXTENSIONS_ANNOTATION: &str = "oaas.io/extensions";

pub const TLS_MOUNT_PATH: &str = "/etc/oaas/tls";

/// A rendered child together with the role it plays for its owner.
#[derive(Clone, Debug)]
pub struct Desired<K> {
    pub role: &'static str,
    pub object: K,
}

impl<K> Desired<K> {
    pub fn new(role: &'static str, object: K) -> Self {
        Self { role, object }
    }
}

pub fn child_name(
    owner: &OwnerIdentity,
    role: &str,
    namespaced: bool,
) -> String {
    if namespaced {
        format!("{}-{}", owner.name, role)
    } else {
        format!("{}-{}-{}", owner.namespace, owner.name, role)
    }
}

/// Name, labels and back-reference shared by every child.
pub fn child_meta(
    owner: &OwnerIdentity,
    registry: &TypeRegistry,
    role: &str,
    namespaced: bool,
) -> Result<ObjectMeta, ConvergeError> {
    let owner_references = if namespaced {
        Some(vec![registry.owner_reference(owner)?])
    } else {
        None
    };
    Ok(ObjectMeta {
        name: Some(child_name(owner, role, namespaced)),
        namespace: namespaced.then(|| owner.namespace.clone()),
        labels: Some(current_labels(owner, role)),
        owner_references,
        ..Default::default()
    })
}

/// Metadata of a certificate secret; held until the owner is gone.
pub fn secret_meta(
    owner: &OwnerIdentity,
    registry: &TypeRegistry,
    role: &str,
) -> Result<ObjectMeta, ConvergeError> {
    let mut meta = child_meta(owner, registry, role, true)?;
    meta.finalizers = Some(vec![WAIT_FOR_OWNER_FINALIZER.to_string()]);
    Ok(meta)
}

/// Pod selector labels for a workload child.
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

pub fn validate_image(image: &str) -> Result<(), ConvergeError> {
    if image.is_empty() {
        return Err(invalid_spec("image is required"));
    }
    let bad_edge = |c: char| matches!(c, ':' | '/' | '@' | '.' | '-');
    if image.chars().any(|c| c.is_whitespace() || c.is_control())
        || image.starts_with(bad_edge)
        || image.ends_with(bad_edge)
    {
        return Err(invalid_spec(format!("invalid image reference {image:?}")));
    }
    Ok(())
}

pub fn validate_port(field: &str, port: i32) -> Result<(), ConvergeError> {
    if !(1..=65535).contains(&port) {
        return Err(invalid_spec(format!("{field} {port} out of range")));
    }
    Ok(())
}

/// RFC 1123 DNS name check for certificate subjects.
pub fn validate_dns_subject(subject: &str) -> Result<(), ConvergeError> {
    let ok_label = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && l.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
            })
            && !l.starts_with('-')
            && !l.ends_with('-')
    };
    if subject.is_empty()
        || subject.len() > 253
        || !subject.split('.').all(ok_label)
    {
        return Err(invalid_spec(format!(
            "invalid certificate subject {subject:?}"
        )));
    }
    Ok(())
}
