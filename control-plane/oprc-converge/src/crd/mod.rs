pub mod common;
pub mod controlplane;
pub mod dataplane;
pub mod gateway;

pub use common::{Condition, ConditionStatus, ExtensionRef, PortSpec};
pub use controlplane::{
    ControlPlane, ControlPlaneSpec, ControlPlaneStatus, WebhookSpec,
};
pub use dataplane::{
    AutoscalingSpec, DataPlane, DataPlaneSpec, DataPlaneStatus,
    DisruptionBudgetSpec,
};
pub use gateway::{Gateway, GatewaySpec, GatewayStatus, ListenerSpec};
