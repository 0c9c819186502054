use std::collections::BTreeSet;

use super::{
    Desired, ROLE_CONTROLPLANE, ROLE_DATAPLANE, child_meta, child_name,
    validate_image, validate_port,
};
use crate::crd::{
    ControlPlane, ControlPlaneSpec, DataPlane, DataPlaneSpec, GatewaySpec,
    PortSpec,
};
use crate::error::{ConvergeError, invalid_spec};
use crate::owner::OwnerIdentity;
use crate::registry::TypeRegistry;

const PROTOCOLS: [&str; 3] = ["HTTP", "HTTPS", "TCP"];

pub fn validate(spec: &GatewaySpec) -> Result<(), ConvergeError> {
    if spec.gateway_class_name.is_empty() {
        return Err(invalid_spec("gatewayClassName is required"));
    }
    if spec.listeners.is_empty() {
        return Err(invalid_spec("at least one listener is required"));
    }
    let mut names = BTreeSet::new();
    for l in &spec.listeners {
        if l.name.is_empty() || !names.insert(l.name.as_str()) {
            return Err(invalid_spec(format!(
                "listener names must be unique and non-empty: {:?}",
                l.name
            )));
        }
        validate_port("listener port", l.port)?;
        if let Some(p) = &l.protocol {
            if !PROTOCOLS.contains(&p.as_str()) {
                return Err(invalid_spec(format!("unsupported protocol {p}")));
            }
        }
    }
    validate_image(&spec.data_plane_image)?;
    validate_image(&spec.control_plane_image)?;
    Ok(())
}

pub fn data_plane_name(owner: &OwnerIdentity) -> String {
    child_name(owner, ROLE_DATAPLANE, true)
}

pub fn data_plane(
    owner: &OwnerIdentity,
    spec: &GatewaySpec,
    registry: &TypeRegistry,
) -> Result<Desired<DataPlane>, ConvergeError> {
    let metadata = child_meta(owner, registry, ROLE_DATAPLANE, true)?;
    let tls = spec
        .listeners
        .iter()
        .any(|l| l.protocol.as_deref() == Some("HTTPS"));
    let dp_spec = DataPlaneSpec {
        image: spec.data_plane_image.clone(),
        replicas: spec.replicas,
        ports: spec
            .listeners
            .iter()
            .map(|l| PortSpec {
                name: l.name.clone(),
                port: l.port,
                target_port: None,
            })
            .collect(),
        service_type: Some("LoadBalancer".into()),
        tls,
        extensions: spec.extensions.clone(),
        ..Default::default()
    };
    let mut dp = DataPlane::new(&data_plane_name(owner), dp_spec);
    dp.metadata = metadata;
    Ok(Desired::new(ROLE_DATAPLANE, dp))
}

pub fn control_plane(
    owner: &OwnerIdentity,
    spec: &GatewaySpec,
    registry: &TypeRegistry,
) -> Result<Desired<ControlPlane>, ConvergeError> {
    let metadata = child_meta(owner, registry, ROLE_CONTROLPLANE, true)?;
    let cp_spec = ControlPlaneSpec {
        image: spec.control_plane_image.clone(),
        data_plane: Some(data_plane_name(owner)),
        env: [(
            "OAAS_GATEWAY_CLASS".to_string(),
            spec.gateway_class_name.clone(),
        )]
        .into(),
        extensions: spec.extensions.clone(),
        ..Default::default()
    };
    let name = child_name(owner, ROLE_CONTROLPLANE, true);
    let mut cp = ControlPlane::new(&name, cp_spec);
    cp.metadata = metadata;
    Ok(Desired::new(ROLE_CONTROLPLANE, cp))
}
