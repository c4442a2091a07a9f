use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error("project has no owning user")]
    MissingUser,
}

impl LabelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabelError::Provider(e) => e.kind(),
            LabelError::Store(e) => e.kind(),
            LabelError::MissingUser => ErrorKind::FatalConfig,
        }
    }
}
