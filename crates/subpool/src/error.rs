//! Error types for Subpool

use thiserror::Error;

/// Main error type for Subpool operations
#[derive(Error, Debug)]
pub enum SubpoolError {
    /// Configuration errors (file, environment overlay, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Group store errors
    #[error("Group error: {0}")]
    Group(String),

    /// Source fetching errors that affect the whole request
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Conversion backend errors
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General errors
    #[error("{0}")]
    General(String),
}

/// Result type alias for Subpool operations
pub type Result<T> = std::result::Result<T, SubpoolError>;
