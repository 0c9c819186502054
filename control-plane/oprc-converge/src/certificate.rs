//! Serving-certificate secrets.
//!
//! A leaf secret is a regular child of its owner with one extra rule: its
//! key material is never patched. A survivor that fails validation is
//! deleted and the next pass issues a replacement from the engine CA.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Resource;
use tracing::{info, warn};

use crate::controller::ConvergeContext;
use crate::ensure::{
    EnsureResult, from_dynamic, merge_metadata, metadata_differs, to_dynamic,
};
use crate::error::ConvergeError;
use crate::generator::secret_meta;
use crate::lister::list_children;
use crate::owner::OwnerIdentity;
use crate::pki::{
    CertificateAuthority, CertificateInfo, PkiError, key_matches,
    verify_issued_by,
};
use crate::reduce::{self, FitnessClass};
use crate::store::WriteOutcome;

pub const TLS_CRT: &str = "tls.crt";
pub const TLS_KEY: &str = "tls.key";
pub const CA_CRT: &str = "ca.crt";

fn secret_str<'a>(secret: &'a Secret, key: &str) -> Option<&'a str> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|b| std::str::from_utf8(&b.0).ok())
}

/// Load the engine CA. A missing secret is transient (it may still be
/// being provisioned); unusable contents are permanent.
pub async fn load_ca(
    ctx: &ConvergeContext,
) -> Result<CertificateAuthority, ConvergeError> {
    let ty = ctx.registry.of::<Secret>()?;
    let cfg = &ctx.cfg.certificates;
    let obj = ctx
        .store
        .get(
            &ty.resource,
            Some(&cfg.ca_secret_namespace),
            &cfg.ca_secret_name,
        )
        .await?
        .ok_or_else(|| {
            ConvergeError::CertificateAuthorityUnavailable(format!(
                "secret {}/{} not found",
                cfg.ca_secret_namespace, cfg.ca_secret_name
            ))
        })?;
    let secret: Secret = from_dynamic(&ty.resource, obj).map_err(|e| {
        ConvergeError::InvalidCertificateAuthority(e.to_string())
    })?;
    let (Some(cert), Some(key)) =
        (secret_str(&secret, TLS_CRT), secret_str(&secret, TLS_KEY))
    else {
        return Err(ConvergeError::InvalidCertificateAuthority(format!(
            "secret {}/{} lacks {TLS_CRT} or {TLS_KEY}",
            cfg.ca_secret_namespace, cfg.ca_secret_name
        )));
    };
    CertificateAuthority::from_pem(cert, key)
        .map_err(|e| ConvergeError::InvalidCertificateAuthority(e.to_string()))
}

/// Why a leaf secret cannot be kept, if it cannot.
pub fn invalid_reason(
    secret: &Secret,
    subject: &str,
    ca: &CertificateAuthority,
) -> Option<String> {
    let (Some(cert), Some(key), Some(_)) = (
        secret_str(secret, TLS_CRT),
        secret_str(secret, TLS_KEY),
        secret_str(secret, CA_CRT),
    ) else {
        return Some("missing certificate material".into());
    };
    let info = match CertificateInfo::from_pem(cert) {
        Ok(i) => i,
        Err(e) => return Some(e.to_string()),
    };
    if !info.matches_subject(subject) {
        return Some(format!("not issued for {subject}"));
    }
    if info.is_expired() {
        return Some("expired".into());
    }
    if info.is_not_yet_valid() {
        return Some("not yet valid".into());
    }
    match key_matches(cert, key) {
        Ok(true) => {}
        Ok(false) => return Some("private key does not match".into()),
        Err(e) => return Some(e.to_string()),
    }
    match verify_issued_by(cert, ca.cert_pem()) {
        Ok(true) => None,
        Ok(false) => Some("not signed by the current CA".into()),
        Err(e) => Some(e.to_string()),
    }
}

fn issue(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    ca: &CertificateAuthority,
    subject: &str,
    role: &str,
) -> Result<Secret, ConvergeError> {
    let issued = ca
        .issue(subject, ctx.cfg.certificates.validity_days)
        .map_err(|e| match e {
            PkiError::CaExpired => {
                ConvergeError::InvalidCertificateAuthority(e.to_string())
            }
            other => ConvergeError::Pki(other),
        })?;
    let data = BTreeMap::from([
        (TLS_CRT.to_string(), ByteString(issued.cert_pem.into_bytes())),
        (TLS_KEY.to_string(), ByteString(issued.key_pem.into_bytes())),
        (
            CA_CRT.to_string(),
            ByteString(ca.cert_pem().as_bytes().to_vec()),
        ),
    ]);
    Ok(Secret {
        metadata: secret_meta(owner, &ctx.registry, role)?,
        type_: Some("kubernetes.io/tls".into()),
        data: Some(data),
        ..Default::default()
    })
}

/// Converge the leaf secret of (owner, role) for `subject`.
pub async fn ensure_certificate(
    ctx: &ConvergeContext,
    owner: &OwnerIdentity,
    subject: &str,
    role: &'static str,
) -> Result<(EnsureResult, Option<Secret>), ConvergeError> {
    let ty = ctx.registry.of::<Secret>()?;
    let resource = &ty.resource;
    let ca = load_ca(ctx).await?;
    let mut children = list_children(ctx, owner, ty, role).await?;

    let mut failures = vec![];
    let survivor = match children.len() {
        0 => {
            let secret = issue(ctx, owner, &ca, subject, role)?;
            let obj = to_dynamic(resource, &secret)?;
            return match ctx.store.create(resource, &obj).await? {
                WriteOutcome::Applied(created) => {
                    info!(%subject, name = ?obj.metadata.name, "issued certificate");
                    Ok((
                        EnsureResult::Created,
                        Some(from_dynamic(resource, created)?),
                    ))
                }
                WriteOutcome::Conflict => Err(ConvergeError::conflict(
                    "Secret",
                    obj.metadata.name.clone().unwrap_or_default(),
                )),
            };
        }
        1 => children.remove(0),
        _ => {
            let Some(res) =
                reduce::resolve(ctx, FitnessClass::Age, children).await?
            else {
                return Ok((EnsureResult::Noop, None));
            };
            let reduced = reduce::apply(ctx, resource, res.losers).await?;
            if reduced.deleted > 0 {
                return Ok((EnsureResult::Deleted, None));
            }
            failures = reduced.failures;
            res.survivor
        }
    };

    let name = survivor.name().to_string();
    let live: Secret = from_dynamic(resource, survivor.object.clone())?;
    if let Some(reason) = invalid_reason(&live, subject, &ca) {
        warn!(%name, %subject, %reason, "replacing invalid certificate");
        reduce::delete_child(ctx, resource, survivor.object).await?;
        return Ok((EnsureResult::Deleted, None));
    }

    let desired = secret_meta(owner, &ctx.registry, role)?;
    if !metadata_differs(live.meta(), &desired) {
        if let Some(e) = failures.into_iter().next() {
            return Err(e);
        }
        return Ok((EnsureResult::Noop, Some(live)));
    }
    let mut merged = live;
    merge_metadata(merged.meta_mut(), &desired);
    match ctx.store.patch(resource, &to_dynamic(resource, &merged)?).await? {
        WriteOutcome::Applied(updated) => {
            info!(%name, "relabelled certificate secret");
            Ok((EnsureResult::Updated, Some(from_dynamic(resource, updated)?)))
        }
        WriteOutcome::Conflict => Err(ConvergeError::conflict("Secret", name)),
    }
}
