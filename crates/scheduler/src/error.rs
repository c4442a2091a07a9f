use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Watch(#[from] watch::WatchError),
    #[error(transparent)]
    Queue(#[from] queue::QueueError),
    #[error(transparent)]
    Label(#[from] labels::LabelError),
    #[error(transparent)]
    Correction(#[from] corrections::CorrectionError),
    #[error(transparent)]
    Provider(#[from] provider::ProviderError),
    #[error(transparent)]
    Extractor(#[from] extractor::ExtractorError),
    #[error(transparent)]
    Resolver(#[from] resolver::ResolverError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Store(e) => e.kind(),
            SchedulerError::Watch(e) => e.kind(),
            SchedulerError::Queue(e) => e.kind(),
            SchedulerError::Label(e) => e.kind(),
            SchedulerError::Correction(e) => e.kind(),
            SchedulerError::Provider(e) => e.kind(),
            SchedulerError::Extractor(e) => e.kind(),
            SchedulerError::Resolver(e) => e.kind(),
        }
    }
}
