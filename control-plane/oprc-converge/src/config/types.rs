use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct EngineConfig {
    #[envconfig(from = "OPRC_CONVERGE_PROFILE", default = "dev")]
    pub profile: String,

    /// Upper bound for one reconcile pass (profile default: 10s dev, 30s full)
    /// Env: OPRC_CONVERGE_PASS_TIMEOUT_SECS
    #[envconfig(from = "OPRC_CONVERGE_PASS_TIMEOUT_SECS")]
    pub pass_timeout_secs: Option<u64>,

    /// Also list children by the pre-`managed-by` labels and heal them
    /// Env: OPRC_CONVERGE_LEGACY_LABELS
    #[envconfig(from = "OPRC_CONVERGE_LEGACY_LABELS")]
    pub legacy_labels: Option<bool>,

    #[envconfig(from = "OPRC_CONVERGE_CLUSTER_DOMAIN", default = "cluster.local")]
    pub cluster_domain: String,

    #[envconfig(nested)]
    pub certificates: CertificateConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct CertificateConfig {
    #[envconfig(
        from = "OPRC_CONVERGE_CA_SECRET_NAME",
        default = "oprc-converge-ca"
    )]
    pub ca_secret_name: String,
    #[envconfig(
        from = "OPRC_CONVERGE_CA_SECRET_NAMESPACE",
        default = "oaas-system"
    )]
    pub ca_secret_namespace: String,
    /// Leaf certificate lifetime, clamped to the CA's own expiry
    /// Env: OPRC_CONVERGE_CERT_VALIDITY_DAYS
    #[envconfig(from = "OPRC_CONVERGE_CERT_VALIDITY_DAYS", default = "365")]
    pub validity_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            ca_secret_name: "oprc-converge-ca".into(),
            ca_secret_namespace: "oaas-system".into(),
            validity_days: 365,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: "dev".into(),
            pass_timeout_secs: None,
            legacy_labels: None,
            cluster_domain: "cluster.local".into(),
            certificates: CertificateConfig::default(),
        }
        .apply_profile_defaults()
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Ok(Self::init_from_env()?.apply_profile_defaults())
    }

    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// Rules:
    /// - dev: pass_timeout=10s
    /// - full: pass_timeout=30s
    ///
    /// Legacy label matching stays on in every profile unless disabled.
    pub fn apply_profile_defaults(mut self) -> Self {
        let def_timeout = match self.profile.as_str() {
            "full" | "prod" | "production" => 30,
            _ /* dev */ => 10,
        };
        if self.pass_timeout_secs.is_none() {
            self.pass_timeout_secs = Some(def_timeout);
        }
        if self.legacy_labels.is_none() {
            self.legacy_labels = Some(true);
        }
        self
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs.unwrap_or(30))
    }

    pub fn legacy_labels(&self) -> bool {
        self.legacy_labels.unwrap_or(true)
    }
}
