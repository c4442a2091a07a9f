use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error("payload did not match expected shape: {0}")]
    BadPayload(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Store(e) => e.kind(),
            QueueError::BadPayload(_) => ErrorKind::ExtractionParse,
        }
    }
}
