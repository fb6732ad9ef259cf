//! Error types for Trawl

use thiserror::Error;

use crate::classify::ClassifyError;
use crate::store::StoreError;

/// Main error type for Trawl operations
#[derive(Error, Debug)]
pub enum TrawlError {
    /// Entry store errors (dial, mode negotiation, protocol)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Protocol capability lookup or representation errors
    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP/WebSocket server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// General errors
    #[error("{0}")]
    General(String),
}

impl From<serde_json::Error> for TrawlError {
    fn from(e: serde_json::Error) -> Self {
        TrawlError::Serialization(e.to_string())
    }
}

/// Result type alias for Trawl operations
pub type Result<T> = std::result::Result<T, TrawlError>;
