//! Local per-domain snapshots the app reads from while offline.

use std::sync::Arc;
use tokio::sync::Mutex;

use lexisync_common::{ChangeOperation, Domain, DomainPayload, Result};
use lexisync_storage::{load_json, save_json, KeyValueStore};

use crate::state::StoreKeys;

/// Read-modify-write access to `lexisync:<ns>:data:<domain>`.
pub struct LocalSnapshots<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore + ?Sized> LocalSnapshots<S> {
    pub fn new(store: Arc<S>, keys: StoreKeys) -> Self {
        Self {
            store,
            keys,
            write_lock: Mutex::new(()),
        }
    }

    /// Current local value of `domain`, empty if nothing was recorded yet.
    pub async fn read(&self, domain: &Domain) -> Result<DomainPayload> {
        let stored: Option<DomainPayload> =
            load_json(self.store.as_ref(), &self.keys.data(domain)).await?;
        Ok(stored.unwrap_or_else(|| DomainPayload::empty(domain)))
    }

    /// Replace the local value of a domain.
    pub async fn write(&self, payload: &DomainPayload) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        save_json(self.store.as_ref(), &self.keys.data(&payload.domain()), payload).await
    }

    /// Apply a recorded change to the local value.
    pub async fn apply(&self, operation: ChangeOperation, change: &DomainPayload) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let domain = change.domain();
        let mut current = self.read(&domain).await?;
        current.apply(operation, change)?;
        save_json(self.store.as_ref(), &self.keys.data(&domain), &current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexisync_common::{ExperienceData, VocabularyData, VocabularyEntry};
    use lexisync_storage::MemoryStore;

    #[tokio::test]
    async fn test_apply_accumulates() {
        let snapshots = LocalSnapshots::new(Arc::new(MemoryStore::new()), StoreKeys::new("t"));
        assert_eq!(
            snapshots.read(&Domain::Vocabulary).await.unwrap(),
            DomainPayload::empty(&Domain::Vocabulary)
        );

        for word in ["hola", "gracias"] {
            let change = DomainPayload::Vocabulary(VocabularyData {
                words: vec![VocabularyEntry::new(word)],
            });
            snapshots.apply(ChangeOperation::Create, &change).await.unwrap();
        }

        let current = snapshots.read(&Domain::Vocabulary).await.unwrap();
        assert_eq!(current.entry_keys(), vec!["hola", "gracias"]);
    }

    #[tokio::test]
    async fn test_write_replaces() {
        let snapshots = LocalSnapshots::new(Arc::new(MemoryStore::new()), StoreKeys::new("t"));
        let value = DomainPayload::Experience(ExperienceData {
            experience: 150,
            level: 2,
        });
        snapshots.write(&value).await.unwrap();
        assert_eq!(snapshots.read(&Domain::Experience).await.unwrap(), value);
    }
}
