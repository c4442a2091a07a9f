use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
}

impl WatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WatchError::Provider(e) => e.kind(),
            WatchError::Store(e) => e.kind(),
            WatchError::Queue(e) => e.kind(),
        }
    }
}
