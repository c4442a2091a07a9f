use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum CorrectionError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
}

impl CorrectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CorrectionError::Store(e) => e.kind(),
        }
    }
}
