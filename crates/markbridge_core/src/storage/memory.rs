//! In-memory key/value store for tests and embedding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{KeyValueStore, StorageResult};

/// A `KeyValueStore` backed by a shared in-memory map.
///
/// Clones share the same underlying storage, which lets a test keep a
/// handle for assertions while the engine owns another.
#[derive(Clone, Default)]
pub struct MemoryKv {
    records: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record (builder pattern, for tests).
    pub fn with_record(self, key: &str, value: Value) -> Self {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
        self
    }

    /// Snapshot a record synchronously (for test assertions).
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.records.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;
    use serde_json::json;

    #[test]
    fn test_get_missing_returns_none() {
        let kv = MemoryKv::new();
        assert!(block_on(kv.get("absent")).unwrap().is_none());
    }

    #[test]
    fn test_set_then_get_roundtrips() {
        let kv = MemoryKv::new();
        block_on(kv.set("k", json!({"a": 1}))).unwrap();
        assert_eq!(block_on(kv.get("k")).unwrap(), Some(json!({"a": 1})));
    }

    #[test]
    fn test_clones_share_storage() {
        let kv = MemoryKv::new();
        let other = kv.clone();
        block_on(kv.set("k", json!(true))).unwrap();
        assert_eq!(other.peek("k"), Some(json!(true)));
    }
}
