//! Owner kinds the engine converges.
//!
//! The set of owners is closed: [`Owner`] is an enum over the typed CRDs
//! and kind-specific behaviour is a `match`. Shared capabilities
//! (conditions, extensions, generation) are exposed through
//! [`OwnerObject`].

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::DynamicObject;
use serde_json::Value;

use crate::crd::{
    Condition, ControlPlane, DataPlane, ExtensionRef, Gateway,
};
use crate::error::{ConvergeError, invalid_spec};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OwnerKind {
    DataPlane,
    ControlPlane,
    Gateway,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::DataPlane => "DataPlane",
            OwnerKind::ControlPlane => "ControlPlane",
            OwnerKind::Gateway => "Gateway",
        }
    }

    /// Value of the `managed-by` label on children.
    pub fn label_value(&self) -> &'static str {
        match self {
            OwnerKind::DataPlane => "dataplane",
            OwnerKind::ControlPlane => "controlplane",
            OwnerKind::Gateway => "gateway",
        }
    }

    /// The aggregate condition type published on this kind.
    pub fn ready_condition(&self) -> &'static str {
        match self {
            OwnerKind::Gateway => "Programmed",
            _ => "Ready",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a driver hands to the engine: "reconcile this owner now".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerKey {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(
        kind: OwnerKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Identity of a live owner, as stamped on its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub generation: i64,
}

pub trait OwnerObject {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn extensions(&self) -> &[ExtensionRef];
    fn generation(&self) -> i64;
    fn set_observed_generation(&mut self, generation: i64);
}

#[derive(Clone, Debug)]
pub enum Owner {
    DataPlane(DataPlane),
    ControlPlane(ControlPlane),
    Gateway(Gateway),
}

impl Owner {
    pub fn from_dynamic(
        kind: OwnerKind,
        obj: DynamicObject,
    ) -> Result<Self, ConvergeError> {
        let value = serde_json::to_value(obj)?;
        Ok(match kind {
            OwnerKind::DataPlane => {
                Owner::DataPlane(serde_json::from_value(value)?)
            }
            OwnerKind::ControlPlane => {
                Owner::ControlPlane(serde_json::from_value(value)?)
            }
            OwnerKind::Gateway => Owner::Gateway(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> OwnerKind {
        match self {
            Owner::DataPlane(_) => OwnerKind::DataPlane,
            Owner::ControlPlane(_) => OwnerKind::ControlPlane,
            Owner::Gateway(_) => OwnerKind::Gateway,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Owner::DataPlane(o) => o.meta(),
            Owner::ControlPlane(o) => o.meta(),
            Owner::Gateway(o) => o.meta(),
        }
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or("default")
    }

    pub fn key(&self) -> OwnerKey {
        OwnerKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn identity(&self) -> Result<OwnerIdentity, ConvergeError> {
        let uid = self
            .meta()
            .uid
            .clone()
            .ok_or_else(|| invalid_spec("owner has no uid"))?;
        Ok(OwnerIdentity {
            kind: self.kind(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
            uid,
            generation: self.generation(),
        })
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Serialized status sub-resource (`null` when unset).
    pub fn status_value(&self) -> Result<Value, ConvergeError> {
        Ok(match self {
            Owner::DataPlane(o) => serde_json::to_value(&o.status)?,
            Owner::ControlPlane(o) => serde_json::to_value(&o.status)?,
            Owner::Gateway(o) => serde_json::to_value(&o.status)?,
        })
    }
}

impl OwnerObject for Owner {
    fn conditions(&self) -> &[Condition] {
        let conds = match self {
            Owner::DataPlane(o) => o.status.as_ref().map(|s| &s.conditions),
            Owner::ControlPlane(o) => {
                o.status.as_ref().map(|s| &s.conditions)
            }
            Owner::Gateway(o) => o.status.as_ref().map(|s| &s.conditions),
        };
        conds.map(|c| c.as_slice()).unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        match self {
            Owner::DataPlane(o) => {
                &mut o.status.get_or_insert_with(Default::default).conditions
            }
            Owner::ControlPlane(o) => {
                &mut o.status.get_or_insert_with(Default::default).conditions
            }
            Owner::Gateway(o) => {
                &mut o.status.get_or_insert_with(Default::default).conditions
            }
        }
    }

    fn extensions(&self) -> &[ExtensionRef] {
        match self {
            Owner::DataPlane(o) => &o.spec.extensions,
            Owner::ControlPlane(o) => &o.spec.extensions,
            Owner::Gateway(o) => &o.spec.extensions,
        }
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    fn set_observed_generation(&mut self, generation: i64) {
        match self {
            Owner::DataPlane(o) => {
                o.status
                    .get_or_insert_with(Default::default)
                    .observed_generation = Some(generation)
            }
            Owner::ControlPlane(o) => {
                o.status
                    .get_or_insert_with(Default::default)
                    .observed_generation = Some(generation)
            }
            Owner::Gateway(o) => {
                o.status
                    .get_or_insert_with(Default::default)
                    .observed_generation = Some(generation)
            }
        }
    }
}
