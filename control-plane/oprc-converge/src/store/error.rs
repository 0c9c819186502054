#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected request ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid object: {0}")]
    InvalidObject(String),
}

impl StoreError {
    /// Client-side rejections (bad request, forbidden, invalid) will not
    /// succeed on retry. Timeouts and throttling will.
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreError::Rejected { code, .. } => {
                (400..500).contains(code) && !matches!(code, 404 | 408 | 429)
            }
            StoreError::InvalidObject(_) | StoreError::Serialization(_) => true,
            StoreError::Unavailable(_) => false,
        }
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => StoreError::Rejected {
                code: resp.code,
                message: resp.message,
            },
            kube::Error::SerdeError(e) => StoreError::Serialization(e),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
