pub mod certificate;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod ensure;
pub mod error;
pub mod generator;
pub mod labels;
pub mod lister;
pub mod owner;
pub mod pki;
pub mod reduce;
pub mod registry;
pub mod status;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, ReconcileOutcome};
pub use ensure::EnsureResult;
pub use error::{ConvergeError, ErrorTier};
pub use owner::{Owner, OwnerKey, OwnerKind};
pub use registry::TypeRegistry;

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init_tracing(default_env: &str) {
    let mut filter = EnvFilter::builder()
        .with_env_var("RUST_LOG")
        .from_env_lossy();
    if let Ok(directive) = default_env.parse().or_else(|_| "info".parse()) {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
