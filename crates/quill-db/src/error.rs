use std::fmt::Display;

/// A specialized error type for store operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist. Non-fatal sentinel.
    #[error("not found")]
    NotFound,
    /// LMDB error from shard operations.
    #[error("heed error: {0}")]
    Heed(#[from] heed::Error),
    /// I/O error from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A persisted key could not be parsed.
    #[error("corrupted key: {0}")]
    CorruptedKey(String),
}

impl StoreError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corrupted-key error from a displayable value.
    pub fn corrupted_key<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::CorruptedKey(msg.to_string())
    }

    /// Whether this error is the `NotFound` sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// A Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
