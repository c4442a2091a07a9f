use types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("optimistic lock failure on {entity} {id}")]
    Conflict { entity: &'static str, id: String },
    #[error("row decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } => ErrorKind::PersistenceConflict,
            StoreError::Database(_) | StoreError::Decode(_) => ErrorKind::Transient,
        }
    }
}
