use std::time::Duration;

use crate::pki::PkiError;
use crate::store::StoreError;

/// How the driver should treat a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// Needs an external spec (or CA) change; surfaced as a condition and
    /// never retried by the engine.
    Permanent,
    /// Retry the whole pass on the next delivery.
    Transient,
}

#[derive(thiserror::Error, Debug)]
pub enum ConvergeError {
    #[error("invalid owner spec: {0}")]
    InvalidSpec(String),

    #[error("kind {0} is not registered")]
    UnknownKind(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid certificate authority: {0}")]
    InvalidCertificateAuthority(String),

    #[error("certificate authority unavailable: {0}")]
    CertificateAuthorityUnavailable(String),

    #[error("certificate error: {0}")]
    Pki(#[from] PkiError),

    #[error("write conflict on {kind} {name}")]
    Conflict { kind: String, name: String },

    #[error("failed to delete {kind} {name}: {reason}")]
    DeleteFailed {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reconcile pass cancelled")]
    Cancelled,

    #[error("reconcile pass exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl ConvergeError {
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        ConvergeError::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn tier(&self) -> ErrorTier {
        match self {
            ConvergeError::InvalidSpec(_)
            | ConvergeError::UnknownKind(_)
            | ConvergeError::Serialization(_)
            | ConvergeError::InvalidCertificateAuthority(_)
            | ConvergeError::Pki(_) => ErrorTier::Permanent,
            ConvergeError::Store(e) if e.is_permanent() => {
                ErrorTier::Permanent
            }
            ConvergeError::CertificateAuthorityUnavailable(_)
            | ConvergeError::Conflict { .. }
            | ConvergeError::DeleteFailed { .. }
            | ConvergeError::Store(_)
            | ConvergeError::Cancelled
            | ConvergeError::DeadlineExceeded(_) => ErrorTier::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.tier() == ErrorTier::Permanent
    }

    /// Condition reason used when the error is published on the owner.
    pub fn reason(&self) -> &'static str {
        match self {
            ConvergeError::InvalidSpec(_) => "InvalidSpec",
            ConvergeError::UnknownKind(_) => "UnsupportedKind",
            ConvergeError::Serialization(_) => "InvalidObject",
            ConvergeError::InvalidCertificateAuthority(_) => {
                "InvalidCertificateAuthority"
            }
            ConvergeError::CertificateAuthorityUnavailable(_) => {
                "CertificateAuthorityUnavailable"
            }
            ConvergeError::Pki(_) => "CertificateIssueFailed",
            ConvergeError::Conflict { .. } => "Conflict",
            ConvergeError::DeleteFailed { .. } => "DeleteFailed",
            ConvergeError::Store(_) => "StoreError",
            ConvergeError::Cancelled => "Cancelled",
            ConvergeError::DeadlineExceeded(_) => "DeadlineExceeded",
        }
    }
}

pub(crate) fn invalid_spec(msg: impl Into<String>) -> ConvergeError {
    ConvergeError::InvalidSpec(msg.into())
}
