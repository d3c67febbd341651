/// Failures from the SQLite-backed repositories.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The on-disk schema cannot be used by this build.
    #[error("schema: {0}")]
    Schema(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A record that cannot be written as given.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("stored JSON is unreadable: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
