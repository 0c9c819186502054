mod types;

pub use types::{CertificateConfig, EngineConfig};
