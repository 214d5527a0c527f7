use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubcollectError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl SubcollectError {
    /// Whether retrying the same operation later could succeed.
    /// Only transient errors are retried by the batch writer.
    pub fn is_transient(&self) -> bool {
        match self {
            SubcollectError::Unavailable(_) | SubcollectError::Io(_) => true,
            SubcollectError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SubcollectError>;
