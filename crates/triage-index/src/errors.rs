use triage_core::errors::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] GatewayError),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("invalid metadata for key {key}: only strings and numbers are allowed")]
    InvalidMetadata { key: String },
}

pub type Result<T> = std::result::Result<T, IndexError>;
