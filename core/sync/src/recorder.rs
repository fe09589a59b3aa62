//! Change recording: the write path for every local mutation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use lexisync_common::{ChangeOperation, Domain, DomainPayload, Error, Result};
use lexisync_storage::KeyValueStore;

use crate::queue::{Appended, PendingChange, PendingQueue};
use crate::snapshot::LocalSnapshots;

/// One mutation handed to the recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeInput {
    pub domain: Domain,
    pub operation: ChangeOperation,
    pub payload: DomainPayload,
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
}

impl ChangeInput {
    pub fn new(domain: Domain, operation: ChangeOperation, payload: DomainPayload) -> Self {
        Self {
            domain,
            operation,
            payload,
            id: None,
        }
    }
}

/// Turns mutations into durable, versioned pending changes.
///
/// A change is on disk before [`ChangeRecorder::record_change`] returns,
/// then applied to the local snapshot so the app reads its own writes.
pub struct ChangeRecorder<S: KeyValueStore + ?Sized> {
    queue: Arc<PendingQueue<S>>,
    snapshots: Arc<LocalSnapshots<S>>,
}

impl<S: KeyValueStore + ?Sized> ChangeRecorder<S> {
    pub fn new(queue: Arc<PendingQueue<S>>, snapshots: Arc<LocalSnapshots<S>>) -> Self {
        Self { queue, snapshots }
    }

    /// Record one mutation.
    ///
    /// # Errors
    /// - `InvalidInput` when the payload belongs to another domain
    /// - `Storage` / `Io` when the change could not be persisted; nothing is
    ///   queued in that case
    pub async fn record_change(&self, input: ChangeInput) -> Result<Appended> {
        let ChangeInput {
            domain,
            operation,
            payload,
            id,
        } = input;

        if payload.domain() != domain {
            return Err(Error::InvalidInput(format!(
                "payload for '{}' recorded under '{}'",
                payload.domain(),
                domain
            )));
        }

        let appended = self
            .queue
            .append(domain.clone(), operation, payload, id)
            .await?;
        let change = &appended.change;

        // Re-applying a duplicate is harmless and repairs a snapshot write
        // that failed after the change was queued.
        if let Err(e) = self.snapshots.apply(change.operation, &change.payload).await {
            warn!(change_id = %change.id, domain = %domain, error = %e, "Local snapshot not updated");
            return Err(e);
        }

        debug!(
            change_id = %change.id,
            domain = %domain,
            operation = %change.operation,
            local_version = change.local_version,
            duplicate = appended.duplicate,
            "Recorded change"
        );
        Ok(appended)
    }

    /// Record mutations one after another, in input order.
    ///
    /// Stops at the first failure; changes recorded before it stay queued.
    pub async fn record_batch(&self, inputs: Vec<ChangeInput>) -> Result<Vec<Appended>> {
        let mut recorded = Vec::with_capacity(inputs.len());
        for input in inputs {
            recorded.push(self.record_change(input).await?);
        }
        Ok(recorded)
    }

    /// Queue a change built elsewhere, as-is.
    pub async fn enqueue(&self, change: PendingChange) -> Result<()> {
        change.payload.validate_for(&change.domain)?;
        self.queue.insert(change).await
    }
}
