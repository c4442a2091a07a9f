use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error("resolver conflict: {0}")]
    Conflict(String),
}

impl ResolverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolverError::Store(e) => e.kind(),
            ResolverError::Conflict(_) => ErrorKind::ResolverConflict,
        }
    }
}
