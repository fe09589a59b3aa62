//! Durable key-value store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use lexisync_common::Result;

/// Durable string-keyed map used for all engine persistence.
///
/// The engine only needs single-key reads and writes. No transactions across
/// keys are assumed, so callers must tolerate one key being updated while
/// another is not.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// # Returns
    /// `None` when the key has never been written or was removed.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    ///
    /// # Postconditions
    /// - When this returns `Ok`, the value survives a process crash
    ///
    /// # Errors
    /// - Storage full, permission denied, I/O errors
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List all keys currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Read and deserialize a JSON value.
pub async fn load_json<T, S>(store: &S, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub async fn save_json<T, S>(store: &S, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, raw).await
}
