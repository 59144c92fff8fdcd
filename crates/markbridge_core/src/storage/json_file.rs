//! JSON-file key/value store used by the CLI.
//!
//! The whole namespace lives in one JSON object on disk. Writes replace
//! the file through a temp-file rename so a crash mid-write cannot leave
//! a truncated store behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{KeyValueStore, StorageError, StorageResult};

/// A `KeyValueStore` persisted to a single JSON file.
pub struct JsonFileKv {
    path: PathBuf,
    records: Mutex<HashMap<String, Value>>,
}

impl JsonFileKv {
    /// Open (or create) the store at `path`.
    ///
    /// A missing file yields an empty store; an unreadable or
    /// undecodable file is an error rather than silent data loss.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let records = match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_json::from_str::<HashMap<String, Value>>(&contents)
                .map_err(|e| StorageError::Decode(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    async fn persist(&self) -> StorageResult<()> {
        let contents = {
            let records = self.records.lock().unwrap();
            serde_json::to_string_pretty(&*records)
                .map_err(|e| StorageError::Decode(e.to_string()))?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileKv {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
        self.persist().await
    }
}
