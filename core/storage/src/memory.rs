//! In-memory key-value store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::store::KeyValueStore;
use lexisync_common::{Error, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory and
/// lost on drop. Clones share the same underlying map, which lets tests
/// simulate a process restart by building a new engine over a clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("Write rejected for key {}", key)));
        }
        Ok(())
    }

    fn poisoned() -> Error {
        Error::Storage("Memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        Ok(storage.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.check_writable(key)?;
        let mut storage = self.storage.write().map_err(|_| Self::poisoned())?;
        storage.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        let mut storage = self.storage.write().map_err(|_| Self::poisoned())?;
        storage.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        let mut keys: Vec<String> = storage.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("pending").await.unwrap().is_none());

        store.set("pending", "[]".to_string()).await.unwrap();
        assert_eq!(store.get("pending").await.unwrap().as_deref(), Some("[]"));

        store.remove("pending").await.unwrap();
        assert!(store.get("pending").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let restarted = store.clone();
        store.set("versions", "{}".to_string()).await.unwrap();
        assert_eq!(restarted.get("versions").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let result = store.set("pending", "[]".to_string()).await;
        assert!(matches!(result, Err(Error::Storage(_))));

        store.set_fail_writes(false);
        store.set("pending", "[]".to_string()).await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["pending".to_string()]);
    }
}
