use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("extractor output did not conform to the schema: {0}")]
    Parse(String),
    #[error("transient extractor error: {0}")]
    Transient(String),
}

impl ExtractorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractorError::Parse(_) => ErrorKind::ExtractionParse,
            ExtractorError::Transient(_) => ErrorKind::Transient,
        }
    }
}
