use crate::shortcode::ShortCode;
use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("original url must not be blank")]
    BlankInput,
    #[error("short code not found: {0}")]
    NotFound(String),
    /// The url was already shortened; carries the code of the existing record.
    #[error("url already shortened as {short_code}")]
    DuplicateContent { short_code: ShortCode },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("storage io failed: {0}")]
    Io(String),
    #[error("no free short code after {0} attempts")]
    CodeSpaceExhausted(u32),
    #[error("storage operation cancelled")]
    Cancelled,
    #[error("storage operation failed: {0}")]
    Operation(String),
}

impl StorageError {
    /// Returns the existing short code when this error is [`StorageError::DuplicateContent`].
    pub fn duplicate_code(&self) -> Option<&ShortCode> {
        match self {
            StorageError::DuplicateContent { short_code } => Some(short_code),
            _ => None,
        }
    }

    /// Whether the failure came from the underlying store rather than the caller's input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Io(value.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
}
