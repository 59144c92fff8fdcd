//! Error types shared across the sync core.

use thiserror::Error;

/// Top-level error for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A key/value storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// A bookmark store operation failed.
    #[error("bookmark store error: {0}")]
    Bookmarks(#[from] crate::bookmarks::BookmarkError),

    /// The legacy reverse HTTP endpoint failed.
    #[error("reverse endpoint error: {0}")]
    Http(String),

    /// The bridge configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, BridgeError>;
