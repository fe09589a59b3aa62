//! Sync metadata tracking and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use lexisync_common::{Domain, Error, Result};
use lexisync_storage::{load_json, save_json, KeyValueStore};

/// Lifecycle state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing in flight.
    Idle,
    /// A batch is being delivered.
    Syncing,
    /// A remote version conflict is being resolved.
    ConflictResolving,
    /// The last attempt failed; a retry or external trigger moves back to idle.
    Error,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Idle
    }
}

/// Counters accumulated across sync cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub changes_delivered: u64,
    pub conflicts_resolved: u64,
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub last_duration: Duration,
}

/// Durable per-user sync bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncMetadata {
    /// Completion time of the last cycle that delivered anything.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    /// Highest acknowledged local version per domain.
    pub data_versions: BTreeMap<Domain, u64>,
    /// Last server version seen per domain.
    pub server_versions: BTreeMap<Domain, u64>,
    /// Ids still waiting for delivery.
    pub pending_operation_ids: BTreeSet<String>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    /// Consecutive failed cycles.
    pub retry_count: u32,
    /// Recently acknowledged change ids, oldest first.
    pub acknowledged: VecDeque<String>,
    pub stats: SyncStats,
}

impl SyncMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load metadata from `store`, or start fresh if none was saved.
    pub async fn load<S: KeyValueStore + ?Sized>(store: &S, key: &str) -> Result<Self> {
        Ok(load_json(store, key).await?.unwrap_or_default())
    }

    /// Persist metadata to `store`.
    pub async fn save<S: KeyValueStore + ?Sized>(&self, store: &S, key: &str) -> Result<()> {
        save_json(store, key, self).await
    }

    /// Serialize state to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize sync metadata: {}", e)))
    }

    /// Deserialize state from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Serialization(format!("Failed to deserialize sync metadata: {}", e))
        })
    }

    /// Record that the server holds `local_version` of `domain`.
    ///
    /// Versions never move backwards.
    pub fn advance_data_version(&mut self, domain: &Domain, local_version: u64) {
        let current = self.data_versions.entry(domain.clone()).or_insert(0);
        *current = (*current).max(local_version);
    }

    /// Record the latest server version observed for `domain`.
    pub fn observe_server_version(&mut self, domain: &Domain, server_version: u64) {
        let current = self.server_versions.entry(domain.clone()).or_insert(0);
        *current = (*current).max(server_version);
    }

    /// Last server version seen for `domain`, 0 if never synced.
    pub fn server_version(&self, domain: &Domain) -> u64 {
        self.server_versions.get(domain).copied().unwrap_or(0)
    }

    /// Remember an acknowledged change id, keeping at most `capacity` ids.
    pub fn record_acknowledged(&mut self, change_id: &str, capacity: usize) {
        self.pending_operation_ids.remove(change_id);
        if self.is_acknowledged(change_id) {
            return;
        }
        self.acknowledged.push_back(change_id.to_string());
        while self.acknowledged.len() > capacity {
            self.acknowledged.pop_front();
        }
    }

    pub fn is_acknowledged(&self, change_id: &str) -> bool {
        self.acknowledged.iter().any(|id| id == change_id)
    }
}

/// Store keys for one sync namespace.
///
/// Every key is prefixed `lexisync:<namespace>:` so several users or
/// profiles can share one store.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("lexisync:{}", namespace),
        }
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    pub fn metadata(&self) -> String {
        format!("{}:metadata", self.prefix)
    }

    pub fn versions(&self) -> String {
        format!("{}:versions", self.prefix)
    }

    /// Key of the local snapshot of `domain`.
    pub fn data(&self, domain: &Domain) -> String {
        format!("{}:data:{}", self.prefix, domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexisync_storage::MemoryStore;

    #[test]
    fn test_data_versions_never_regress() {
        let mut metadata = SyncMetadata::new();
        metadata.advance_data_version(&Domain::Vocabulary, 5);
        metadata.advance_data_version(&Domain::Vocabulary, 3);
        assert_eq!(metadata.data_versions[&Domain::Vocabulary], 5);

        metadata.observe_server_version(&Domain::Vocabulary, 9);
        metadata.observe_server_version(&Domain::Vocabulary, 2);
        assert_eq!(metadata.server_version(&Domain::Vocabulary), 9);
        assert_eq!(metadata.server_version(&Domain::Experience), 0);
    }

    #[test]
    fn test_acknowledged_history_is_bounded() {
        let mut metadata = SyncMetadata::new();
        metadata.pending_operation_ids.insert("c0".to_string());
        for i in 0..5 {
            metadata.record_acknowledged(&format!("c{}", i), 3);
        }
        metadata.record_acknowledged("c4", 3);

        assert_eq!(metadata.acknowledged, vec!["c2", "c3", "c4"]);
        assert!(!metadata.is_acknowledged("c0"));
        assert!(metadata.pending_operation_ids.is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut metadata = SyncMetadata::new();
        metadata.status = SyncStatus::ConflictResolving;
        metadata.advance_data_version(&Domain::UserStats, 2);
        metadata.stats.last_duration = Duration::from_millis(250);

        let json = metadata.to_json().unwrap();
        assert!(json.contains("\"dataVersions\""));
        assert!(json.contains("\"conflict_resolving\""));

        let restored = SyncMetadata::from_json(&json).unwrap();
        assert_eq!(restored.status, SyncStatus::ConflictResolving);
        assert_eq!(restored.data_versions[&Domain::UserStats], 2);
        assert_eq!(restored.stats.last_duration, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_load_missing_is_default() {
        let store = MemoryStore::new();
        let keys = StoreKeys::new("u1");

        let metadata = SyncMetadata::load(&store, &keys.metadata()).await.unwrap();
        assert_eq!(metadata.status, SyncStatus::Idle);

        let mut metadata = metadata;
        metadata.retry_count = 2;
        metadata.save(&store, &keys.metadata()).await.unwrap();
        let restored = SyncMetadata::load(&store, &keys.metadata()).await.unwrap();
        assert_eq!(restored.retry_count, 2);
    }

    #[test]
    fn test_store_keys() {
        let keys = StoreKeys::new("alice");
        assert_eq!(keys.pending(), "lexisync:alice:pending");
        assert_eq!(keys.data(&Domain::UserStats), "lexisync:alice:data:user_stats");
    }
}
