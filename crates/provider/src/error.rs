use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("credentials expired and could not be refreshed")]
    AuthExpired,
    #[error("quota exceeded until cooldown")]
    QuotaExceeded,
    #[error("message body could not be parsed: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transient(_) | ProviderError::QuotaExceeded => ErrorKind::Transient,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::AuthExpired => ErrorKind::AuthExpired,
            ProviderError::Parse(_) => ErrorKind::ExtractionParse,
        }
    }
}
