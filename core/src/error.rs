use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backup database is not open")]
    NotOpen,
    #[error("{0}")]
    Collaborator(String),
    #[error("Sync cancelled")]
    Cancelled,
}
