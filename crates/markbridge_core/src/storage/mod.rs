//! Key/value storage abstraction.
//!
//! The host runtime owns persistent storage; the core only sees an async
//! get/set over string keys with JSON values. Two implementations ship
//! here: `MemoryKv` for tests and embedding, and `JsonFileKv` for the
//! CLI, which persists the whole namespace to a single JSON file.

mod json_file;
mod memory;

pub use json_file::JsonFileKv;
pub use memory::MemoryKv;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error raised by a key/value backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failed.
    #[error("storage io error: {0}")]
    Io(String),
    /// The stored bytes were not decodable.
    #[error("storage decode error: {0}")]
    Decode(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Async key/value capability consumed by the sync core.
///
/// Values are whole JSON records; callers read and write entire records
/// atomically (there is no partial update).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the record stored under `key`, if any.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Replace the record stored under `key`.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;
}
