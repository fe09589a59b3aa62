//! Durable queue of changes waiting for delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use lexisync_common::{ChangeOperation, Domain, DomainPayload, Error, Result};
use lexisync_storage::{load_json, save_json, ChangeEnvelope, KeyValueStore};

use crate::state::StoreKeys;

/// A recorded mutation waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Unique id, also used by the server to detect re-delivery.
    pub id: String,
    pub domain: Domain,
    pub operation: ChangeOperation,
    pub payload: DomainPayload,
    /// Per-domain sequence number assigned at record time.
    pub local_version: u64,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
    /// Failed delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Earliest time the next retry may run.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Quarantine reason. Blocked changes are never delivered until cleared.
    #[serde(default)]
    pub blocked: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingChange {
    /// Wire form of the change.
    pub fn to_envelope(&self) -> ChangeEnvelope {
        ChangeEnvelope {
            change_id: self.id.clone(),
            domain: self.domain.clone(),
            operation: self.operation,
            payload: self.payload.clone(),
            local_version: self.local_version,
            checksum: self.checksum.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Whether automatic retries are exhausted.
    pub fn is_parked(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Whether the backoff window has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Result of appending a change.
#[derive(Debug, Clone)]
pub struct Appended {
    pub change: PendingChange,
    /// An identical change was already queued and was returned instead.
    pub duplicate: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    changes: Vec<PendingChange>,
    /// Last local version handed out per domain.
    versions: BTreeMap<Domain, u64>,
}

/// Durable, ordered set of pending changes plus per-domain version counters.
///
/// Every mutation is written through to the store before it returns.
/// The lock is held across the write so concurrent recorders are
/// serialized and never share a version number.
pub struct PendingQueue<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    keys: StoreKeys,
    inner: Mutex<QueueInner>,
    len: AtomicUsize,
    blocked: AtomicUsize,
}

impl<S: KeyValueStore + ?Sized> PendingQueue<S> {
    /// Load the queue from `store`.
    ///
    /// Version counters are reconciled against the pending changes and
    /// `acknowledged_versions`, so a counter that was not persisted before a
    /// crash never causes a version to be handed out twice.
    pub async fn load(
        store: Arc<S>,
        keys: StoreKeys,
        acknowledged_versions: &BTreeMap<Domain, u64>,
    ) -> Result<Self> {
        let changes: Vec<PendingChange> = load_json(store.as_ref(), &keys.pending())
            .await?
            .unwrap_or_default();
        let mut versions: BTreeMap<Domain, u64> = load_json(store.as_ref(), &keys.versions())
            .await?
            .unwrap_or_default();

        for (domain, version) in acknowledged_versions {
            let counter = versions.entry(domain.clone()).or_insert(0);
            *counter = (*counter).max(*version);
        }
        for change in &changes {
            let counter = versions.entry(change.domain.clone()).or_insert(0);
            *counter = (*counter).max(change.local_version);
        }

        debug!(pending = changes.len(), "Loaded pending queue");

        let queue = Self {
            store,
            keys,
            inner: Mutex::new(QueueInner { changes, versions }),
            len: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
        };
        {
            let inner = queue.inner.lock().await;
            queue.refresh_counts(&inner);
        }
        Ok(queue)
    }

    /// Record a new change under the next version of `domain`.
    ///
    /// A change identical to the latest queued change of its domain (same
    /// operation and payload checksum), or one carrying an id that is already
    /// queued, is not queued twice; the existing change is returned with
    /// `duplicate` set. An older identical change does not count, since a
    /// later edit of the domain would otherwise win.
    ///
    /// # Errors
    /// The pending set could not be persisted. Nothing is queued in that case.
    pub async fn append(
        &self,
        domain: Domain,
        operation: ChangeOperation,
        payload: DomainPayload,
        id: Option<String>,
    ) -> Result<Appended> {
        let checksum = payload.checksum()?;
        let mut inner = self.inner.lock().await;

        let existing = match &id {
            Some(id) => inner.changes.iter().find(|c| &c.id == id),
            None => inner
                .changes
                .iter()
                .filter(|c| c.domain == domain)
                .max_by_key(|c| c.local_version)
                .filter(|latest| {
                    latest.operation == operation
                        && latest.checksum == checksum
                        && !latest.is_blocked()
                }),
        };
        if let Some(existing) = existing {
            debug!(change_id = %existing.id, domain = %domain, "Duplicate change ignored");
            return Ok(Appended {
                change: existing.clone(),
                duplicate: true,
            });
        }

        let local_version = inner.versions.get(&domain).copied().unwrap_or(0) + 1;
        let change = PendingChange {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            domain: domain.clone(),
            operation,
            payload,
            local_version,
            timestamp: Utc::now(),
            checksum,
            attempts: 0,
            next_attempt_at: None,
            blocked: None,
            last_error: None,
        };

        inner.changes.push(change.clone());
        if let Err(e) = self.persist_changes(&inner).await {
            inner.changes.pop();
            return Err(e);
        }

        inner.versions.insert(domain, local_version);
        if let Err(e) = save_json(self.store.as_ref(), &self.keys.versions(), &inner.versions).await
        {
            // Recovered from the pending set on the next load.
            warn!(error = %e, "Failed to persist version counters");
        }

        self.refresh_counts(&inner);
        Ok(Appended {
            change,
            duplicate: false,
        })
    }

    /// Insert a change built elsewhere, keeping its id and version.
    pub async fn insert(&self, change: PendingChange) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.changes.iter().any(|c| c.id == change.id) {
            return Ok(());
        }

        let previous_counter = inner.versions.get(&change.domain).copied();
        let counter = previous_counter.unwrap_or(0).max(change.local_version);
        inner.versions.insert(change.domain.clone(), counter);
        inner.changes.push(change);

        if let Err(e) = self.persist_changes(&inner).await {
            if let Some(rejected) = inner.changes.pop() {
                match previous_counter {
                    Some(previous) => inner.versions.insert(rejected.domain, previous),
                    None => inner.versions.remove(&rejected.domain),
                };
            }
            return Err(e);
        }
        save_json(self.store.as_ref(), &self.keys.versions(), &inner.versions).await?;
        self.refresh_counts(&inner);
        Ok(())
    }

    /// Pick up to `limit` deliverable changes, oldest first.
    ///
    /// Blocked changes are skipped. Changes still backing off, or whose
    /// retries are exhausted, are skipped together with every later change
    /// of the same domain, so a domain is never delivered out of order.
    pub async fn select_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Vec<PendingChange> {
        let inner = self.inner.lock().await;
        let mut held: HashSet<&Domain> = HashSet::new();
        let mut batch = Vec::new();

        for change in ordered(&inner.changes) {
            if batch.len() >= limit {
                break;
            }
            if change.is_blocked() || held.contains(&change.domain) {
                continue;
            }
            if change.is_parked(max_attempts) || !change.is_due(now) {
                held.insert(&change.domain);
                continue;
            }
            batch.push(change.clone());
        }
        batch
    }

    /// Make parked and backing-off changes eligible again.
    ///
    /// # Returns
    /// Number of changes re-armed.
    pub async fn rearm(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut rearmed = 0;
        for change in inner.changes.iter_mut().filter(|c| !c.is_blocked()) {
            if change.attempts > 0 || change.next_attempt_at.is_some() {
                change.attempts = 0;
                change.next_attempt_at = None;
                rearmed += 1;
            }
        }
        if rearmed > 0 {
            self.persist_changes(&inner).await?;
        }
        Ok(rearmed)
    }

    /// Drop delivered or superseded changes.
    pub async fn remove(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let before = inner.changes.len();
        inner.changes.retain(|c| !ids.contains(&c.id));
        if inner.changes.len() != before {
            self.persist_changes(&inner).await?;
            self.refresh_counts(&inner);
        }
        Ok(())
    }

    /// Count a failed delivery and schedule the next attempt.
    ///
    /// `backoff` maps the number of attempts made so far to the delay.
    pub async fn record_failure<F>(&self, ids: &[String], error: &str, backoff: F) -> Result<()>
    where
        F: Fn(u32) -> Duration,
    {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        for change in inner.changes.iter_mut().filter(|c| ids.contains(&c.id)) {
            change.attempts += 1;
            let delay = chrono::Duration::from_std(backoff(change.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            change.next_attempt_at = Some(now + delay);
            change.last_error = Some(error.to_string());
        }
        self.persist_changes(&inner).await
    }

    /// Quarantine changes. They stay queued but are never delivered.
    pub async fn block(&self, ids: &[String], reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for change in inner.changes.iter_mut().filter(|c| ids.contains(&c.id)) {
            change.blocked = Some(reason.to_string());
            change.last_error = Some(reason.to_string());
        }
        self.persist_changes(&inner).await?;
        self.refresh_counts(&inner);
        Ok(())
    }

    /// Lift the quarantine of a change so it is delivered again.
    pub async fn unblock(&self, id: &str) -> Result<PendingChange> {
        let mut inner = self.inner.lock().await;
        let change = inner
            .changes
            .iter_mut()
            .find(|c| c.id == id && c.is_blocked())
            .ok_or_else(|| Error::NotFound(format!("Blocked change not found: {}", id)))?;
        change.blocked = None;
        change.attempts = 0;
        change.next_attempt_at = None;
        let released = change.clone();

        self.persist_changes(&inner).await?;
        self.refresh_counts(&inner);
        Ok(released)
    }

    /// Discard a quarantined change.
    pub async fn discard_blocked(&self, id: &str) -> Result<PendingChange> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .changes
            .iter()
            .position(|c| c.id == id && c.is_blocked())
            .ok_or_else(|| Error::NotFound(format!("Blocked change not found: {}", id)))?;
        let removed = inner.changes.remove(index);

        if let Err(e) = self.persist_changes(&inner).await {
            inner.changes.insert(index, removed);
            return Err(e);
        }
        self.refresh_counts(&inner);
        Ok(removed)
    }

    /// All queued changes, oldest first.
    pub async fn snapshot(&self) -> Vec<PendingChange> {
        let inner = self.inner.lock().await;
        ordered(&inner.changes).cloned().collect()
    }

    pub async fn blocked(&self) -> Vec<PendingChange> {
        let inner = self.inner.lock().await;
        ordered(&inner.changes)
            .filter(|c| c.is_blocked())
            .cloned()
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.changes.iter().map(|c| c.id.clone()).collect()
    }

    /// Last local version handed out for `domain`.
    pub async fn current_version(&self, domain: &Domain) -> u64 {
        let inner = self.inner.lock().await;
        inner.versions.get(domain).copied().unwrap_or(0)
    }

    /// Earliest pending retry among changes that will be retried automatically.
    pub async fn next_retry_at(&self, max_attempts: u32) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .changes
            .iter()
            .filter(|c| !c.is_blocked() && !c.is_parked(max_attempts))
            .filter_map(|c| c.next_attempt_at)
            .min()
    }

    /// Number of queued changes, without waiting on the lock.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of quarantined changes, without waiting on the lock.
    pub fn blocked_len(&self) -> usize {
        self.blocked.load(Ordering::SeqCst)
    }

    async fn persist_changes(&self, inner: &QueueInner) -> Result<()> {
        save_json(self.store.as_ref(), &self.keys.pending(), &inner.changes).await
    }

    fn refresh_counts(&self, inner: &QueueInner) {
        self.len.store(inner.changes.len(), Ordering::SeqCst);
        self.blocked.store(
            inner.changes.iter().filter(|c| c.is_blocked()).count(),
            Ordering::SeqCst,
        );
    }
}

/// Changes in recording order.
fn ordered(changes: &[PendingChange]) -> impl Iterator<Item = &PendingChange> {
    let mut sorted: Vec<&PendingChange> = changes.iter().collect();
    sorted.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.local_version.cmp(&b.local_version))
    });
    sorted.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexisync_common::{ExperienceData, VocabularyData, VocabularyEntry};
    use lexisync_storage::MemoryStore;

    fn experience(value: u64) -> DomainPayload {
        DomainPayload::Experience(ExperienceData {
            experience: value,
            level: 1,
        })
    }

    fn vocab(word: &str) -> DomainPayload {
        DomainPayload::Vocabulary(VocabularyData {
            words: vec![VocabularyEntry::new(word)],
        })
    }

    async fn queue(store: &MemoryStore) -> PendingQueue<MemoryStore> {
        PendingQueue::load(
            Arc::new(store.clone()),
            StoreKeys::new("test"),
            &BTreeMap::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_versions_are_per_domain_and_increasing() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;

        let a = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await
            .unwrap();
        let b = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("b"), None)
            .await
            .unwrap();
        let x = queue
            .append(Domain::Experience, ChangeOperation::Update, experience(5), None)
            .await
            .unwrap();

        assert_eq!(a.change.local_version, 1);
        assert_eq!(b.change.local_version, 2);
        assert_eq!(x.change.local_version, 1);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_is_not_queued_twice() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;

        let first = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await
            .unwrap();
        let second = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.change.id, first.change.id);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.current_version(&Domain::Vocabulary).await, 1);
    }

    #[tokio::test]
    async fn test_revert_to_earlier_value_is_queued() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;

        let first = queue
            .append(Domain::Vocabulary, ChangeOperation::Update, vocab("a"), None)
            .await
            .unwrap();
        queue
            .append(Domain::Vocabulary, ChangeOperation::Update, vocab("b"), None)
            .await
            .unwrap();
        let third = queue
            .append(Domain::Vocabulary, ChangeOperation::Update, vocab("a"), None)
            .await
            .unwrap();

        assert!(!third.duplicate);
        assert_ne!(third.change.id, first.change.id);
        assert_eq!(third.change.local_version, 3);
        assert_eq!(queue.len(), 3);

        let repeat = queue
            .append(Domain::Vocabulary, ChangeOperation::Update, vocab("a"), None)
            .await
            .unwrap();
        assert!(repeat.duplicate);
        assert_eq!(repeat.change.id, third.change.id);
    }

    #[tokio::test]
    async fn test_failed_write_queues_nothing() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;
        store.set_fail_writes(true);

        let result = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await;
        assert!(result.is_err());
        assert!(queue.is_empty());
        assert_eq!(queue.current_version(&Domain::Vocabulary).await, 0);
    }

    #[tokio::test]
    async fn test_reload_reconciles_counters() {
        let store = MemoryStore::new();
        {
            let queue = queue(&store).await;
            for word in ["a", "b", "c"] {
                queue
                    .append(Domain::Vocabulary, ChangeOperation::Create, vocab(word), None)
                    .await
                    .unwrap();
            }
        }

        // Counters lost, pending set survived.
        store.remove("lexisync:test:versions").await.unwrap();
        let mut acknowledged = BTreeMap::new();
        acknowledged.insert(Domain::Experience, 7);
        let queue = PendingQueue::load(Arc::new(store.clone()), StoreKeys::new("test"), &acknowledged)
            .await
            .unwrap();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.current_version(&Domain::Vocabulary).await, 3);
        let next = queue
            .append(Domain::Experience, ChangeOperation::Update, experience(1), None)
            .await
            .unwrap();
        assert_eq!(next.change.local_version, 8);
    }

    #[tokio::test]
    async fn test_backoff_holds_later_changes_of_domain() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;

        let first = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await
            .unwrap();
        queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("b"), None)
            .await
            .unwrap();
        queue
            .append(Domain::Experience, ChangeOperation::Update, experience(3), None)
            .await
            .unwrap();

        queue
            .record_failure(&[first.change.id.clone()], "offline", |_| {
                Duration::from_secs(60)
            })
            .await
            .unwrap();

        let batch = queue.select_batch(10, Utc::now(), 5).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].domain, Domain::Experience);

        assert_eq!(queue.rearm().await.unwrap(), 1);
        let batch = queue.select_batch(10, Utc::now(), 5).await;
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_block_and_release() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;
        let appended = queue
            .append(Domain::Vocabulary, ChangeOperation::Create, vocab("a"), None)
            .await
            .unwrap();
        let id = appended.change.id.clone();

        queue.block(&[id.clone()], "schema").await.unwrap();
        assert_eq!(queue.blocked_len(), 1);
        assert!(queue.select_batch(10, Utc::now(), 5).await.is_empty());

        let released = queue.unblock(&id).await.unwrap();
        assert!(released.blocked.is_none());
        assert_eq!(queue.select_batch(10, Utc::now(), 5).await.len(), 1);

        queue.block(&[id.clone()], "schema").await.unwrap();
        queue.discard_blocked(&id).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.discard_blocked(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let store = MemoryStore::new();
        let queue = queue(&store).await;
        for i in 0..5 {
            queue
                .append(Domain::Vocabulary, ChangeOperation::Create, vocab(&format!("w{}", i)), None)
                .await
                .unwrap();
        }
        let batch = queue.select_batch(2, Utc::now(), 5).await;
        assert_eq!(
            batch.iter().map(|c| c.local_version).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
