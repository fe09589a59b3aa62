//! Core sync engine that orchestrates recording, delivery and conflict
//! resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lexisync_common::{ChangeOperation, Domain, DomainPayload, Error, Result};
use lexisync_storage::{ChangeOutcome, KeyValueStore, PushRequest, RemoteEndpoint, RemoteSnapshot};

use crate::conflict::{Conflict, ConflictResolver, ResolutionSource};
use crate::events::{EventBus, SyncEvent};
use crate::network::ConnectivityProbe;
use crate::queue::{Appended, PendingChange, PendingQueue};
use crate::recorder::{ChangeInput, ChangeRecorder};
use crate::retry::{with_timeout, RetryConfig, RetryExecutor};
use crate::scheduler::{SkipReason, SyncMode, SyncResult, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
use crate::snapshot::LocalSnapshots;
use crate::state::{StoreKeys, SyncMetadata, SyncStatus};
use crate::strategy::{StrategyConfig, StrategySelector, SyncContext, SyncStrategy};

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Store key namespace, usually the user id.
    pub namespace: String,
    /// Consecutive transport failures before a change is parked.
    pub max_retry_attempts: u32,
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub retry_base_delay: Duration,
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub retry_max_delay: Duration,
    pub retry_jitter: bool,
    /// Deadline for each push or fetch call.
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub delivery_timeout: Duration,
    /// Batch size used until a strategy is applied.
    pub default_batch_size: usize,
    /// Domains whose changes start a sync immediately.
    pub high_priority_domains: Vec<Domain>,
    /// Acknowledged change ids remembered for re-delivery detection.
    pub acknowledged_history: usize,
    /// Retries for fetching the server value during conflict resolution.
    pub fetch_retries: u32,
    pub strategy: StrategyConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            max_retry_attempts: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            retry_jitter: false,
            delivery_timeout: Duration::from_secs(30),
            default_batch_size: 50,
            high_priority_domains: vec![Domain::Experience, Domain::Achievements, Domain::UserStats],
            acknowledged_history: 500,
            fetch_retries: 2,
            strategy: StrategyConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Check settings loaded from user input before they reach the engine.
    pub fn validate(&self) -> Result<()> {
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::InvalidInput(format!(
                "retry_base_delay {:?} exceeds retry_max_delay {:?}",
                self.retry_base_delay, self.retry_max_delay
            )));
        }
        if self.default_batch_size == 0 {
            return Err(Error::InvalidInput(
                "default_batch_size must be at least 1".to_string(),
            ));
        }
        self.strategy.validate()
    }

    /// Backoff schedule for failed deliveries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retry_attempts)
            .with_base_delay(self.retry_base_delay)
            .with_max_delay(self.retry_max_delay)
            .with_jitter(self.retry_jitter)
    }
}

/// Point-in-time view of the engine, cheap to read while a cycle runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub status: SyncStatus,
    pub is_syncing: bool,
    pub queue_length: usize,
    pub blocked: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub strategy: SyncStrategy,
}

#[derive(Debug, Clone, Default)]
struct StatusView {
    status: SyncStatus,
    last_sync: Option<DateTime<Utc>>,
    retry_count: u32,
    last_error: Option<String>,
}

impl StatusView {
    fn from_metadata(metadata: &SyncMetadata) -> Self {
        Self {
            status: metadata.status,
            last_sync: metadata.last_sync_timestamp,
            retry_count: metadata.retry_count,
            last_error: metadata.last_error.clone(),
        }
    }
}

/// Conflicting changes of one domain and the newest server value reported.
#[derive(Debug, Default)]
struct ConflictSet {
    changes: Vec<PendingChange>,
    server: Option<RemoteSnapshot>,
}

impl ConflictSet {
    fn push(&mut self, change: PendingChange, server: RemoteSnapshot) {
        self.changes.push(change);
        let newer = self
            .server
            .as_ref()
            .map_or(true, |current| server.version > current.version);
        if newer {
            self.server = Some(server);
        }
    }
}

/// Bookkeeping for one sync cycle.
struct Cycle {
    result: SyncResult,
    last_error: Option<String>,
    failed: bool,
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Main sync engine.
///
/// Owns the pending queue, the sync metadata and the local snapshots. All
/// writes to them go through the engine, and at most one sync cycle runs at
/// a time.
pub struct SyncEngine<S: KeyValueStore + ?Sized, R: RemoteEndpoint + ?Sized> {
    store: Arc<S>,
    remote: Arc<R>,
    keys: StoreKeys,
    queue: Arc<PendingQueue<S>>,
    snapshots: Arc<LocalSnapshots<S>>,
    recorder: ChangeRecorder<S>,
    metadata: Mutex<SyncMetadata>,
    status_view: StdRwLock<StatusView>,
    conflict_resolver: ConflictResolver,
    retry_config: RetryConfig,
    fetch_executor: RetryExecutor,
    connectivity: Arc<dyn ConnectivityProbe>,
    selector: StrategySelector,
    strategy: StdRwLock<SyncStrategy>,
    events: EventBus,
    syncing: AtomicBool,
    cancel_requested: AtomicBool,
    scheduler: Option<SyncScheduler>,
    retry_timer: StdMutex<Option<JoinHandle<()>>>,
    config: SyncConfig,
}

impl<S, R> SyncEngine<S, R>
where
    S: KeyValueStore + ?Sized + 'static,
    R: RemoteEndpoint + ?Sized + 'static,
{
    /// Open the engine over a store, reconciling whatever a previous run
    /// left behind.
    ///
    /// Changes acknowledged before a crash but still queued are dropped,
    /// version counters are recomputed, and a cycle interrupted mid-flight is
    /// reset to idle.
    pub async fn open(
        store: Arc<S>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivityProbe>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let keys = StoreKeys::new(&config.namespace);
        let mut metadata = SyncMetadata::load(store.as_ref(), &keys.metadata()).await?;
        let queue = PendingQueue::load(store.clone(), keys.clone(), &metadata.data_versions).await?;

        let acknowledged: Vec<String> = queue
            .ids()
            .await
            .into_iter()
            .filter(|id| metadata.is_acknowledged(id))
            .collect();
        if !acknowledged.is_empty() {
            info!(count = acknowledged.len(), "Dropping changes acknowledged before restart");
            queue.remove(&acknowledged).await?;
        }

        metadata.pending_operation_ids = queue.ids().await.into_iter().collect();
        if matches!(
            metadata.status,
            SyncStatus::Syncing | SyncStatus::ConflictResolving
        ) {
            warn!(status = ?metadata.status, "Previous sync cycle was interrupted");
            metadata.status = SyncStatus::Idle;
        }
        metadata.save(store.as_ref(), &keys.metadata()).await?;

        let queue = Arc::new(queue);
        let snapshots = Arc::new(LocalSnapshots::new(store.clone(), keys.clone()));
        let retry_config = config.retry_config();
        let fetch_executor = RetryExecutor::new(
            RetryConfig::new(config.fetch_retries)
                .with_base_delay(config.retry_base_delay)
                .with_max_delay(config.retry_max_delay),
        );
        let strategy = SyncStrategy {
            batch_size: config.default_batch_size.max(1),
            ..SyncStrategy::default()
        };

        info!(
            namespace = %config.namespace,
            store = store.name(),
            remote = remote.name(),
            pending = queue.len(),
            "Sync engine opened"
        );

        Ok(Self {
            recorder: ChangeRecorder::new(queue.clone(), snapshots.clone()),
            status_view: StdRwLock::new(StatusView::from_metadata(&metadata)),
            metadata: Mutex::new(metadata),
            store,
            remote,
            keys,
            queue,
            snapshots,
            conflict_resolver: ConflictResolver::new(),
            retry_config,
            fetch_executor,
            connectivity,
            selector: StrategySelector::new(config.strategy.clone()),
            strategy: StdRwLock::new(strategy),
            events: EventBus::default(),
            syncing: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            scheduler: None,
            retry_timer: StdMutex::new(None),
            config,
        })
    }

    /// Replace the conflict resolver, e.g. to override a domain's policy.
    pub fn with_conflict_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.conflict_resolver = resolver;
        self
    }

    /// Initialize the scheduler and return a handle for running it.
    pub fn init_scheduler(&mut self) -> SyncSchedulerHandle {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::from_strategy(&self.strategy()));
        self.scheduler = Some(scheduler);
        handle
    }

    /// Get the scheduler for requesting syncs.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    /// Drive the scheduler loop with this engine. Spawn it on the runtime.
    pub async fn run_worker(self: Arc<Self>, handle: SyncSchedulerHandle) {
        handle
            .run(move |trigger| {
                let engine = self.clone();
                async move { engine.run_sync(trigger).await }
            })
            .await;
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Receive engine events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ---- recording ----

    /// Record a local mutation and queue it for delivery.
    ///
    /// Returns once the change is durable. A change in a high-priority
    /// domain starts a sync right away.
    pub async fn record_change(
        &self,
        domain: Domain,
        operation: ChangeOperation,
        payload: DomainPayload,
    ) -> Result<String> {
        self.record(ChangeInput::new(domain, operation, payload))
            .await
    }

    /// Record a mutation described by a [`ChangeInput`].
    pub async fn record(&self, input: ChangeInput) -> Result<String> {
        let appended = self.recorder.record_change(input).await?;
        self.after_record(&appended).await;
        Ok(appended.change.id)
    }

    /// Record several mutations in order.
    pub async fn record_batch(&self, inputs: Vec<ChangeInput>) -> Result<Vec<String>> {
        let recorded = self.recorder.record_batch(inputs).await?;
        let mut ids = Vec::with_capacity(recorded.len());
        for appended in &recorded {
            self.after_record(appended).await;
            ids.push(appended.change.id.clone());
        }
        Ok(ids)
    }

    /// Queue a fully built change, keeping its id and version.
    pub async fn enqueue(&self, change: PendingChange) -> Result<()> {
        self.recorder.enqueue(change.clone()).await?;
        self.after_record(&Appended {
            change,
            duplicate: false,
        })
        .await;
        Ok(())
    }

    async fn after_record(&self, appended: &Appended) {
        if appended.duplicate {
            return;
        }
        let change = &appended.change;
        self.events.emit(SyncEvent::ChangeRecorded {
            change_id: change.id.clone(),
            domain: change.domain.clone(),
            local_version: change.local_version,
        });

        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let mode = scheduler.get_mode().await;
        if mode == SyncMode::Manual {
            return;
        }
        if self.is_high_priority(&change.domain) {
            scheduler.notify(SyncTrigger::HighPriorityChange);
        } else if mode.syncs_on_change() {
            scheduler.notify(SyncTrigger::ChangeRecorded);
        }
    }

    fn is_high_priority(&self, domain: &Domain) -> bool {
        self.config.high_priority_domains.contains(domain)
    }

    // ---- reading ----

    /// Local value of a domain, including changes not yet delivered.
    pub async fn local_data(&self, domain: &Domain) -> Result<DomainPayload> {
        self.snapshots.read(domain).await
    }

    /// Current status. Never waits on an in-flight cycle.
    pub fn get_sync_status(&self) -> SyncStatusSnapshot {
        let view = self
            .status_view
            .read()
            .map(|v| v.clone())
            .unwrap_or_default();
        SyncStatusSnapshot {
            status: view.status,
            is_syncing: self.syncing.load(Ordering::SeqCst),
            queue_length: self.queue.len(),
            blocked: self.queue.blocked_len(),
            last_sync: view.last_sync,
            retry_count: view.retry_count,
            last_error: view.last_error,
            strategy: self.strategy(),
        }
    }

    /// Copy of the durable metadata.
    pub async fn metadata(&self) -> SyncMetadata {
        self.metadata.lock().await.clone()
    }

    pub async fn pending_changes(&self) -> Vec<PendingChange> {
        self.queue.snapshot().await
    }

    /// Changes held back because they failed validation or were rejected.
    pub async fn blocked_changes(&self) -> Vec<PendingChange> {
        self.queue.blocked().await
    }

    /// Discard a quarantined change.
    pub async fn clear_blocked(&self, change_id: &str) -> Result<()> {
        let removed = self.queue.discard_blocked(change_id).await?;
        info!(change_id, domain = %removed.domain, "Discarded blocked change");
        self.sync_pending_ids().await
    }

    /// Return a quarantined change to the queue, e.g. after a server fix.
    pub async fn release_blocked(&self, change_id: &str) -> Result<()> {
        let released = self.queue.unblock(change_id).await?;
        info!(change_id, domain = %released.domain, "Released blocked change");
        Ok(())
    }

    // ---- strategy ----

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
            .read()
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Switch to `strategy`. A running worker adopts the new interval at once.
    pub async fn set_strategy(&self, strategy: SyncStrategy) {
        if let Ok(mut current) = self.strategy.write() {
            *current = strategy;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.set_mode(SyncMode::from_strategy(&strategy)).await;
        }
        debug!(
            interval = ?strategy.interval,
            batch_size = strategy.batch_size,
            real_time = strategy.real_time,
            "Sync strategy applied"
        );
    }

    /// Evaluate `context` and apply the resulting strategy.
    pub async fn apply_context(&self, context: &SyncContext) -> SyncStrategy {
        let strategy = self.selector.evaluate(context);
        self.set_strategy(strategy).await;
        strategy
    }

    // ---- external triggers ----

    /// Connectivity came back: sync now, including parked changes.
    pub async fn on_network_available(&self) -> Result<()> {
        self.trigger(SyncTrigger::NetworkRestored).await
    }

    /// The app came to the foreground: sync now, including parked changes.
    pub async fn on_foreground(&self) -> Result<()> {
        self.trigger(SyncTrigger::Foreground).await
    }

    async fn trigger(&self, trigger: SyncTrigger) -> Result<()> {
        match &self.scheduler {
            Some(scheduler) => {
                scheduler.notify(trigger);
                Ok(())
            }
            None => self.run_sync(trigger).await.map(|_| ()),
        }
    }

    /// Stop the running cycle after the current domain group.
    pub fn cancel(&self) {
        if self.syncing.load(Ordering::SeqCst) {
            info!("Sync cancellation requested");
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
    }

    // ---- sync cycle ----

    /// Run one sync cycle now.
    pub async fn sync_now(&self) -> Result<SyncResult> {
        self.run_sync(SyncTrigger::Manual).await
    }

    /// Run one sync cycle for `trigger`.
    ///
    /// Returns a skipped result when offline, when another cycle is in
    /// flight, or when nothing is eligible for delivery.
    pub async fn run_sync(&self, trigger: SyncTrigger) -> Result<SyncResult> {
        if !self.connectivity.is_online() {
            debug!(?trigger, "Offline, sync skipped");
            return Ok(SyncResult::skipped(trigger, SkipReason::Offline, self.queue.len()));
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(?trigger, "Sync already in flight");
            return Ok(SyncResult::skipped(
                trigger,
                SkipReason::AlreadySyncing,
                self.queue.len(),
            ));
        }
        let guard = SyncingGuard(&self.syncing);
        self.cancel_requested.store(false, Ordering::SeqCst);

        let outcome = self.run_cycle(trigger).await;
        drop(guard);
        if let Err(e) = &outcome {
            error!(?trigger, error = %e, "Sync cycle aborted");
            self.events.emit(SyncEvent::SyncFailed {
                error: e.to_string(),
            });
            let message = e.to_string();
            if let Err(save_err) = self
                .update_metadata(|m| {
                    m.status = SyncStatus::Error;
                    m.last_error = Some(message);
                })
                .await
            {
                warn!(error = %save_err, "Failed to record sync failure");
            }
        }
        self.schedule_retry().await;
        outcome
    }

    async fn run_cycle(&self, trigger: SyncTrigger) -> Result<SyncResult> {
        let start = Instant::now();
        let max_attempts = self.config.max_retry_attempts;

        if trigger.rearms_parked() {
            let rearmed = self.queue.rearm().await?;
            if rearmed > 0 {
                debug!(rearmed, ?trigger, "Waiting changes made eligible");
            }
        }

        let batch_size = self.strategy().batch_size.max(1);
        let selected = self
            .queue
            .select_batch(batch_size, Utc::now(), max_attempts)
            .await;

        // Already acknowledged by the server: drop instead of resubmitting.
        let (acknowledged, batch): (Vec<PendingChange>, Vec<PendingChange>) = {
            let metadata = self.metadata.lock().await;
            selected
                .into_iter()
                .partition(|c| metadata.is_acknowledged(&c.id))
        };
        if !acknowledged.is_empty() {
            debug!(count = acknowledged.len(), "Dropping already acknowledged changes");
            self.queue.remove(&ids_of(&acknowledged)).await?;
        }

        if batch.is_empty() {
            return Ok(SyncResult::skipped(
                trigger,
                SkipReason::NothingPending,
                self.queue.len(),
            ));
        }

        info!(?trigger, changes = batch.len(), "Starting sync cycle");
        self.set_status(SyncStatus::Syncing).await?;

        let mut cycle = Cycle {
            result: SyncResult::new(trigger),
            last_error: None,
            failed: false,
        };

        for (domain, changes) in group_by_domain(batch) {
            if self.cancel_requested.load(Ordering::SeqCst) {
                info!(domain = %domain, "Sync cancelled before domain group");
                cycle.result.cancelled = true;
                break;
            }
            if let Err(e) = self.sync_domain(&domain, changes, &mut cycle).await {
                error!(domain = %domain, error = %e, "Domain sync failed");
                cycle.failed = true;
                cycle.last_error = Some(e.to_string());
            }
        }

        self.finish_cycle(cycle, start).await
    }

    async fn finish_cycle(&self, cycle: Cycle, start: Instant) -> Result<SyncResult> {
        let Cycle {
            mut result,
            last_error,
            failed,
        } = cycle;
        result.remaining = self.queue.len();
        result.duration = start.elapsed();

        let pending_ids = self.queue.ids().await;
        let status = if failed {
            SyncStatus::Error
        } else {
            SyncStatus::Idle
        };

        self.update_metadata(|m| {
            m.status = status;
            if result.changes_synced > 0 {
                m.last_sync_timestamp = Some(Utc::now());
            }
            m.retry_count = if failed { m.retry_count + 1 } else { 0 };
            match &last_error {
                Some(err) => m.last_error = Some(err.clone()),
                None if !failed => m.last_error = None,
                None => {}
            }
            m.pending_operation_ids = pending_ids.into_iter().collect();
            m.stats.total_syncs += 1;
            if failed {
                m.stats.failed_syncs += 1;
            } else {
                m.stats.successful_syncs += 1;
            }
            m.stats.changes_delivered += result.changes_synced as u64;
            m.stats.conflicts_resolved += result.conflicts_found as u64;
            m.stats.last_duration = result.duration;
        })
        .await?;

        self.events.emit(SyncEvent::StatusChanged { status });
        if failed {
            self.events.emit(SyncEvent::SyncFailed {
                error: last_error.unwrap_or_else(|| "delivery failed".to_string()),
            });
        }
        self.events.emit(SyncEvent::SyncCompleted {
            result: result.clone(),
        });

        info!(
            trigger = ?result.trigger,
            synced = result.changes_synced,
            failed = result.changes_failed,
            conflicts = result.conflicts_found,
            blocked = result.changes_blocked,
            remaining = result.remaining,
            "Sync cycle finished"
        );
        Ok(result)
    }

    /// Validate, deliver and settle the changes of one domain.
    async fn sync_domain(
        &self,
        domain: &Domain,
        changes: Vec<PendingChange>,
        cycle: &mut Cycle,
    ) -> Result<()> {
        let mut deliverable = Vec::with_capacity(changes.len());
        for change in changes {
            match change.payload.validate_for(domain) {
                Ok(()) => deliverable.push(change),
                Err(e) => {
                    let reason = e.to_string();
                    self.quarantine(std::slice::from_ref(&change), &reason, cycle)
                        .await?;
                }
            }
        }
        if deliverable.is_empty() {
            return Ok(());
        }
        order_for_delivery(&mut deliverable);

        let conflicts = match self.deliver(domain, &deliverable, cycle).await? {
            Some(conflicts) if !conflicts.changes.is_empty() => conflicts,
            _ => return Ok(()),
        };

        self.set_status(SyncStatus::ConflictResolving).await?;
        let resolved = self.resolve_conflicts(domain, conflicts, cycle).await;
        self.set_status(SyncStatus::Syncing).await?;
        resolved
    }

    /// Push `changes` and settle every outcome except conflicts.
    ///
    /// # Returns
    /// `None` when the push itself failed, otherwise the conflicting changes.
    async fn deliver(
        &self,
        domain: &Domain,
        changes: &[PendingChange],
        cycle: &mut Cycle,
    ) -> Result<Option<ConflictSet>> {
        let known_version = self.metadata.lock().await.server_version(domain);
        let mut known_versions = BTreeMap::new();
        known_versions.insert(domain.clone(), known_version);
        let request = PushRequest {
            changes: changes.iter().map(PendingChange::to_envelope).collect(),
            known_versions,
        };

        debug!(domain = %domain, count = changes.len(), known_version, "Delivering changes");
        let pushed = with_timeout(
            self.config.delivery_timeout,
            "push",
            self.remote.push(request),
        )
        .await;

        match pushed {
            Ok(outcomes) => self
                .apply_outcomes(domain, changes, outcomes, cycle)
                .await
                .map(Some),
            Err(e) => {
                self.record_delivery_failure(domain, changes, &e, cycle)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn apply_outcomes(
        &self,
        domain: &Domain,
        changes: &[PendingChange],
        outcomes: Vec<ChangeOutcome>,
        cycle: &mut Cycle,
    ) -> Result<ConflictSet> {
        let mut by_id: HashMap<String, ChangeOutcome> = outcomes
            .into_iter()
            .map(|o| (o.change_id().to_string(), o))
            .collect();

        let mut acknowledged: Vec<(&PendingChange, u64)> = Vec::new();
        let mut rejected: Vec<(PendingChange, String)> = Vec::new();
        let mut missing: Vec<PendingChange> = Vec::new();
        let mut conflicts = ConflictSet::default();

        for change in changes {
            match by_id.remove(&change.id) {
                Some(ChangeOutcome::Applied { server_version, .. })
                | Some(ChangeOutcome::AlreadyApplied { server_version, .. }) => {
                    acknowledged.push((change, server_version));
                }
                Some(ChangeOutcome::Conflict { server, .. }) => {
                    conflicts.push(change.clone(), server);
                }
                Some(ChangeOutcome::Rejected { reason, .. }) => {
                    rejected.push((change.clone(), reason));
                }
                None => missing.push(change.clone()),
            }
        }

        if !acknowledged.is_empty() {
            // Metadata first: a crash before the queue write then drops the
            // change at startup instead of resubmitting it.
            let capacity = self.config.acknowledged_history;
            self.update_metadata(|m| {
                for (change, server_version) in &acknowledged {
                    m.advance_data_version(domain, change.local_version);
                    m.observe_server_version(domain, *server_version);
                    m.record_acknowledged(&change.id, capacity);
                }
            })
            .await?;

            let ids: Vec<String> = acknowledged.iter().map(|(c, _)| c.id.clone()).collect();
            self.queue.remove(&ids).await?;

            for (change, server_version) in &acknowledged {
                debug!(change_id = %change.id, domain = %domain, server_version, "Change delivered");
                self.events.emit(SyncEvent::ChangeDelivered {
                    change_id: change.id.clone(),
                    domain: domain.clone(),
                    server_version: *server_version,
                });
            }
            cycle.result.changes_synced += acknowledged.len();
        }

        for (change, reason) in rejected {
            self.quarantine(std::slice::from_ref(&change), &reason, cycle)
                .await?;
        }

        if !missing.is_empty() {
            let err = Error::Remote("no outcome reported for change".to_string());
            self.record_delivery_failure(domain, &missing, &err, cycle)
                .await?;
        }

        Ok(conflicts)
    }

    async fn resolve_conflicts(
        &self,
        domain: &Domain,
        conflicts: ConflictSet,
        cycle: &mut Cycle,
    ) -> Result<()> {
        let ConflictSet { changes, server } = conflicts;

        // Prefer a fresh read; the value reported with the conflict is the fallback.
        let fetched = self
            .fetch_executor
            .execute(|| with_timeout(self.config.delivery_timeout, "fetch", self.remote.fetch(domain)))
            .await;
        let snapshot = match (fetched, server) {
            (Ok(snapshot), _) => snapshot,
            (Err(e), Some(reported)) => {
                warn!(domain = %domain, error = %e, "Fetch failed, using reported server value");
                reported
            }
            (Err(e), None) => {
                return self.record_delivery_failure(domain, &changes, &e, cycle).await;
            }
        };

        let local_data = self.snapshots.read(domain).await?;
        let conflict = Conflict {
            domain: domain.clone(),
            local_data,
            server_data: snapshot
                .payload
                .clone()
                .unwrap_or_else(|| DomainPayload::empty(domain)),
            local_timestamp: changes
                .iter()
                .map(|c| c.timestamp)
                .max()
                .unwrap_or_else(Utc::now),
            server_timestamp: snapshot.updated_at,
        };

        self.update_metadata(|m| m.observe_server_version(domain, snapshot.version))
            .await?;

        if !self
            .conflict_resolver
            .has_conflict(&conflict.local_data, &conflict.server_data, domain)
        {
            debug!(domain = %domain, "Server already holds the local value");
            return self.settle_superseded(domain, &changes).await;
        }

        let severity = self.conflict_resolver.conflict_severity(&conflict);
        let resolution = match self.conflict_resolver.resolve(&conflict) {
            Ok(resolution) => resolution,
            Err(e) => return self.quarantine(&changes, &e.to_string(), cycle).await,
        };
        if let Err(e) = resolution.resolved_data.validate_for(domain) {
            let reason = format!("resolved value is invalid: {}", e);
            return self.quarantine(&changes, &reason, cycle).await;
        }

        info!(
            domain = %domain,
            source = ?resolution.source,
            confidence = ?resolution.confidence,
            severity = ?severity,
            reason = %resolution.reason,
            "Conflict resolved"
        );
        cycle.result.conflicts_found += 1;
        self.events.emit(SyncEvent::ConflictResolved {
            domain: domain.clone(),
            source: resolution.source,
            confidence: resolution.confidence,
            severity,
        });

        match resolution.source {
            ResolutionSource::Local => {
                // Known server version is current now; resubmit once.
                if let Some(still) = self.deliver(domain, &changes, cycle).await? {
                    if !still.changes.is_empty() {
                        warn!(
                            domain = %domain,
                            count = still.changes.len(),
                            "Conflict persisted after resubmission, left queued"
                        );
                    }
                }
            }
            ResolutionSource::Server => {
                self.snapshots.write(&resolution.resolved_data).await?;
                self.settle_superseded(domain, &changes).await?;
            }
            ResolutionSource::Merged => {
                self.snapshots.write(&resolution.resolved_data).await?;
                self.settle_superseded(domain, &changes).await?;
                let appended = self
                    .recorder
                    .record_change(ChangeInput::new(
                        domain.clone(),
                        ChangeOperation::Update,
                        resolution.resolved_data,
                    ))
                    .await?;
                debug!(
                    change_id = %appended.change.id,
                    domain = %domain,
                    "Merged value queued for delivery"
                );
                self.after_record(&appended).await;
            }
        }
        Ok(())
    }

    /// Drop changes whose effect is already reflected in the resolved value.
    ///
    /// The remote never acknowledged them, so `data_versions` stays put. The
    /// queue's persisted counters keep their versions from being reused.
    async fn settle_superseded(&self, domain: &Domain, changes: &[PendingChange]) -> Result<()> {
        debug!(domain = %domain, count = changes.len(), "Dropping superseded changes");
        self.queue.remove(&ids_of(changes)).await
    }

    /// Count a failed delivery. Validation failures are quarantined,
    /// everything else backs off.
    async fn record_delivery_failure(
        &self,
        domain: &Domain,
        changes: &[PendingChange],
        err: &Error,
        cycle: &mut Cycle,
    ) -> Result<()> {
        if err.is_validation() {
            return self.quarantine(changes, &err.to_string(), cycle).await;
        }

        let message = err.to_string();
        let retry = &self.retry_config;
        self.queue
            .record_failure(&ids_of(changes), &message, |attempts| {
                retry.delay_for_attempt(attempts.saturating_sub(1))
            })
            .await?;

        let attempt = changes.iter().map(|c| c.attempts + 1).max().unwrap_or(1);
        if attempt >= self.config.max_retry_attempts {
            warn!(
                domain = %domain,
                attempt,
                error = %message,
                "Retries exhausted, waiting for an external trigger"
            );
        } else {
            warn!(domain = %domain, attempt, error = %message, "Delivery failed, will retry");
        }

        cycle.result.changes_failed += changes.len();
        cycle.last_error = Some(message);
        cycle.failed = true;
        Ok(())
    }

    /// Hold changes back until someone clears or releases them.
    async fn quarantine(
        &self,
        changes: &[PendingChange],
        reason: &str,
        cycle: &mut Cycle,
    ) -> Result<()> {
        self.queue.block(&ids_of(changes), reason).await?;
        for change in changes {
            warn!(change_id = %change.id, domain = %change.domain, reason, "Change quarantined");
            self.events.emit(SyncEvent::ChangeBlocked {
                change_id: change.id.clone(),
                domain: change.domain.clone(),
                reason: reason.to_string(),
            });
        }
        cycle.result.changes_blocked += changes.len();
        cycle.last_error = Some(reason.to_string());
        Ok(())
    }

    /// Arm a timer for the earliest backoff deadline, if any change is
    /// backing off.
    async fn schedule_retry(&self) {
        let Some(scheduler) = self.scheduler.clone() else {
            return;
        };
        let Some(at) = self
            .queue
            .next_retry_at(self.config.max_retry_attempts)
            .await
        else {
            return;
        };

        // Small margin so the change is due when the retry runs.
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO) + Duration::from_millis(5);
        debug!(?delay, "Retry scheduled");
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.notify(SyncTrigger::Retry);
        });

        if let Ok(mut slot) = self.retry_timer.lock() {
            if let Some(previous) = slot.replace(timer) {
                previous.abort();
            }
        }
    }

    async fn set_status(&self, status: SyncStatus) -> Result<()> {
        self.update_metadata(|m| m.status = status).await?;
        self.events.emit(SyncEvent::StatusChanged { status });
        Ok(())
    }

    async fn sync_pending_ids(&self) -> Result<()> {
        let ids = self.queue.ids().await;
        self.update_metadata(|m| m.pending_operation_ids = ids.into_iter().collect())
            .await
    }

    /// Mutate and persist the metadata, then refresh the status view.
    async fn update_metadata<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SyncMetadata),
    {
        let mut metadata = self.metadata.lock().await;
        mutate(&mut metadata);
        let saved = metadata
            .save(self.store.as_ref(), &self.keys.metadata())
            .await;
        if let Ok(mut view) = self.status_view.write() {
            *view = StatusView::from_metadata(&metadata);
        }
        saved
    }
}

impl<S: KeyValueStore + ?Sized, R: RemoteEndpoint + ?Sized> Drop for SyncEngine<S, R> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.retry_timer.lock() {
            if let Some(timer) = slot.take() {
                timer.abort();
            }
        }
    }
}

fn ids_of(changes: &[PendingChange]) -> Vec<String> {
    changes.iter().map(|c| c.id.clone()).collect()
}

/// Split a batch into per-domain groups, each in local version order.
fn group_by_domain(batch: Vec<PendingChange>) -> BTreeMap<Domain, Vec<PendingChange>> {
    let mut groups: BTreeMap<Domain, Vec<PendingChange>> = BTreeMap::new();
    for change in batch {
        groups.entry(change.domain.clone()).or_default().push(change);
    }
    for changes in groups.values_mut() {
        changes.sort_by_key(|c| c.local_version);
    }
    groups
}

/// Deletes, then updates, then creates; version order within each kind.
fn order_for_delivery(changes: &mut [PendingChange]) {
    changes.sort_by_key(|c| (c.operation.apply_rank(), c.local_version));
}
