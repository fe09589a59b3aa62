//! Local filesystem key-value store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::store::KeyValueStore;
use lexisync_common::{Error, Result};

/// Characters escaped in file names. Keys like `lexisync:default:pending`
/// keep their dashes and underscores readable on disk.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Suffix of in-flight writes.
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem key-value store.
///
/// Stores one file per key in a root directory. Writes land in a temporary
/// file that is synced and then renamed over the target, so a crash leaves
/// either the old or the new value, never a torn one.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let file_name = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        self.root.join(file_name)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let path = self.key_path(key);
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        };

        write
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to remove {}: {}", key, e))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            keys.push(percent_decode_str(name).decode_utf8_lossy().into_owned());
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_round_trip_and_keys() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store
            .set("lexisync:default:data:vocabulary", "{\"words\":[]}".to_string())
            .await
            .unwrap();
        store.set("lexisync:default:pending", "[]".to_string()).await.unwrap();

        assert_eq!(
            store.get("lexisync:default:pending").await.unwrap().as_deref(),
            Some("[]")
        );
        assert_eq!(
            store.keys().await.unwrap(),
            vec![
                "lexisync:default:data:vocabulary".to_string(),
                "lexisync:default:pending".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_key_and_remove() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        assert!(store.get("nothing").await.unwrap().is_none());
        store.remove("nothing").await.unwrap();

        store.set("k", "v".to_string()).await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let temp = TempDir::new().unwrap();

        {
            let store = FileStore::new(temp.path()).unwrap();
            store.set("metadata", "{\"status\":\"idle\"}".to_string()).await.unwrap();
        }

        {
            let store = FileStore::new(temp.path()).unwrap();
            assert!(store.get("metadata").await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();

        store.set("pending", "[1]".to_string()).await.unwrap();
        store.set("pending", "[1,2]".to_string()).await.unwrap();

        assert_eq!(store.get("pending").await.unwrap().as_deref(), Some("[1,2]"));
        let files = std::fs::read_dir(temp.path()).unwrap().count();
        assert_eq!(files, 1);
    }
}
