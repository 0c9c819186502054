//! In-process certificate authority for serving certificates.
//!
//! The engine holds the CA key only for the duration of a pass: a leaf is
//! issued by generating a fresh key pair, building a CSR for the subject
//! and signing it with the CA loaded from its secret. Leaf validity never
//! outlives the CA.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, PublicKeyData, SanType, string::Ia5String,
};
use thiserror::Error;
use x509_parser::prelude::*;

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("invalid certificate subject {0:?}")]
    InvalidSubject(String),

    #[error("certificate authority expired")]
    CaExpired,
}

pub type Result<T> = std::result::Result<T, PkiError>;

fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

fn dns_name(subject: &str) -> Result<SanType> {
    Ia5String::try_from(subject.to_string())
        .map(SanType::DnsName)
        .map_err(|_| PkiError::InvalidSubject(subject.to_string()))
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("OaaS".to_string()),
    );
    dn
}

/// Validity window, subject names and issuer-facing fields of a
/// certificate.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub not_before: i64,
    pub not_after: i64,
    pub common_name: String,
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            PkiError::Parse(format!("failed to parse certificate: {e}"))
        })?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|n| match n {
                    GeneralName::DNSName(d) => Some(d.to_string()),
                    _ => None,
                })
                .collect(),
            _ => vec![],
        };

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            dns_names,
        })
    }

    pub fn is_expired(&self) -> bool {
        now_unix() >= self.not_after
    }

    pub fn is_not_yet_valid(&self) -> bool {
        now_unix() < self.not_before
    }

    /// CN or any DNS SAN equals `subject`.
    pub fn matches_subject(&self, subject: &str) -> bool {
        self.common_name == subject
            || self.dns_names.iter().any(|d| d == subject)
    }
}

/// Certificate and key PEM of an issued leaf.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Key pair and CSR generated for one subject.
pub struct LeafRequest {
    key_pem: String,
    csr_pem: String,
}

impl LeafRequest {
    pub fn new(subject: &str) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate key: {e}"))
        })?;
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(subject);
        params.subject_alt_names = vec![dns_name(subject)?];

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to create CSR: {e}"
            ))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to serialize CSR: {e}"
            ))
        })?;

        Ok(Self { key_pem, csr_pem })
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

#[derive(Clone)]
pub struct CertificateAuthority {
    // KeyPair is not Clone; re-parsed on each signing.
    key_pem: String,
    cert_pem: String,
    not_after: i64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Self-signed CA valid from now for `validity_days`.
    pub fn new(common_name_str: &str, validity_days: i64) -> Result<Self> {
        let now = ::time::OffsetDateTime::now_utc();
        Self::new_between(
            common_name_str,
            now,
            now + ::time::Duration::days(validity_days),
        )
    }

    pub fn new_between(
        cn: &str,
        not_before: ::time::OffsetDateTime,
        not_after: ::time::OffsetDateTime,
    ) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = common_name(cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate CA key: {e}"))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to create CA cert: {e}"
            ))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
            not_after: not_after.unix_timestamp(),
        })
    }

    /// Load a CA from its certificate and key PEM, validating both.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem).map_err(|e| {
            PkiError::Parse(format!("failed to parse CA key: {e}"))
        })?;
        let info = CertificateInfo::from_pem(cert_pem)?;
        Ok(Self {
            key_pem: key_pem.to_string(),
            cert_pem: cert_pem.to_string(),
            not_after: info.not_after,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    fn issuer_key(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem).map_err(|e| {
            PkiError::Parse(format!("failed to load CA key: {e}"))
        })
    }

    /// Issue a serving certificate for `subject` valid for
    /// `validity_days`, clamped to this CA's expiry.
    pub fn issue(
        &self,
        subject: &str,
        validity_days: u32,
    ) -> Result<IssuedCertificate> {
        let now = ::time::OffsetDateTime::now_utc();
        if now.unix_timestamp() >= self.not_after {
            return Err(PkiError::CaExpired);
        }
        let ca_not_after =
            ::time::OffsetDateTime::from_unix_timestamp(self.not_after)
                .map_err(|e| PkiError::Parse(e.to_string()))?;
        let wanted = now + ::time::Duration::days(validity_days as i64);
        self.issue_between(subject, now, wanted.min(ca_not_after))
    }

    pub fn issue_between(
        &self,
        subject: &str,
        not_before: ::time::OffsetDateTime,
        not_after: ::time::OffsetDateTime,
    ) -> Result<IssuedCertificate> {
        let request = LeafRequest::new(subject)?;
        let cert_pem =
            self.sign_csr(request.csr_pem(), subject, not_before, not_after)?;
        Ok(IssuedCertificate {
            cert_pem,
            key_pem: request.key_pem,
        })
    }

    /// Sign a CSR; subject, usages and validity are set by the CA, only the
    /// public key is taken from the request.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        subject: &str,
        not_before: ::time::OffsetDateTime,
        not_after: ::time::OffsetDateTime,
    ) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| {
                PkiError::InvalidCsr(format!("failed to parse CSR: {e}"))
            })?;

        csr_params.params.distinguished_name = common_name(subject);
        csr_params.params.subject_alt_names = vec![dns_name(subject)?];
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth];
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_after;

        let ca_key = self.issuer_key()?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| {
                PkiError::Parse(format!("failed to create issuer: {e}"))
            })?;
        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to sign certificate: {e}"
            ))
        })?;
        Ok(signed.pem())
    }
}

/// Whether `cert_pem` carries a valid signature from `ca_cert_pem`.
pub fn verify_issued_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
        PkiError::Parse(format!("failed to parse certificate: {e}"))
    })?;
    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der).map_err(|e| {
        PkiError::Parse(format!("failed to parse CA cert: {e}"))
    })?;
    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// The private key parses and belongs to the certificate.
pub fn key_matches(cert_pem: &str, key_pem: &str) -> Result<bool> {
    let key = KeyPair::from_pem(key_pem)
        .map_err(|e| PkiError::Parse(format!("failed to parse key: {e}")))?;
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
        PkiError::Parse(format!("failed to parse certificate: {e}"))
    })?;
    Ok(cert.public_key().raw == key.subject_public_key_info().as_slice())
}
