//! Sync scheduling: triggers, periodic ticks and the worker loop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use lexisync_common::{Error, Result};

use crate::strategy::SyncStrategy;

/// When the worker runs sync cycles on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests.
    Manual,
    /// Immediately after every recorded change.
    OnDemand,
    /// At regular intervals.
    Periodic { interval: Duration },
    /// Both on change and at regular intervals.
    Hybrid { interval: Duration },
}

impl SyncMode {
    /// Mode matching a selected strategy.
    pub fn from_strategy(strategy: &SyncStrategy) -> Self {
        if strategy.real_time {
            SyncMode::Hybrid {
                interval: strategy.interval,
            }
        } else {
            SyncMode::Periodic {
                interval: strategy.interval,
            }
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    /// Whether any recorded change starts a cycle.
    pub fn syncs_on_change(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Why a sync cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Explicit request from the app or user.
    Manual,
    /// A change in a high-priority domain was recorded.
    HighPriorityChange,
    /// A change was recorded while syncing on change.
    ChangeRecorded,
    /// Periodic tick.
    Scheduled,
    /// Backoff timer of a failed delivery elapsed.
    Retry,
    /// Connectivity came back.
    NetworkRestored,
    /// The app returned to the foreground.
    Foreground,
}

impl SyncTrigger {
    /// Whether the trigger gives up on backoff and exhausted retries.
    ///
    /// Automatic triggers respect the backoff schedule. Ticks and external
    /// signals make every waiting change eligible again.
    pub fn rearms_parked(self) -> bool {
        matches!(
            self,
            SyncTrigger::Manual
                | SyncTrigger::Scheduled
                | SyncTrigger::NetworkRestored
                | SyncTrigger::Foreground
        )
    }
}

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    NothingPending,
}

/// Sync result from the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub trigger: SyncTrigger,
    pub changes_synced: usize,
    pub changes_failed: usize,
    pub conflicts_found: usize,
    pub changes_blocked: usize,
    /// Changes still queued after the cycle.
    pub remaining: usize,
    /// The cycle stopped early because it was cancelled.
    pub cancelled: bool,
    pub skipped: Option<SkipReason>,
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub duration: Duration,
}

impl SyncResult {
    pub fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            changes_synced: 0,
            changes_failed: 0,
            conflicts_found: 0,
            changes_blocked: 0,
            remaining: 0,
            cancelled: false,
            skipped: None,
            duration: Duration::ZERO,
        }
    }

    pub fn skipped(trigger: SyncTrigger, reason: SkipReason, remaining: usize) -> Self {
        Self {
            skipped: Some(reason),
            remaining,
            ..Self::new(trigger)
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run one sync cycle.
    Sync(SyncTrigger),
    /// Shutdown the scheduler.
    Shutdown,
}

type Responder = Option<oneshot::Sender<Result<SyncResult>>>;

/// Front end of the sync worker.
///
/// Clones talk to the same worker.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<(SyncRequest, Responder)>,
    shutdown: Arc<RwLock<bool>>,
    mode_changed: Arc<Notify>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));
        let mode_changed = Arc::new(Notify::new());

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
            mode_changed: mode_changed.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
            mode_changed,
        };

        (scheduler, handle)
    }

    /// Run a cycle on the worker and wait for its result.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Sync(trigger), Some(response_tx)))
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive sync result".to_string()))?
    }

    /// Ask for a cycle without waiting for it.
    ///
    /// Dropped when the request queue is full; a cycle is pending anyway.
    pub fn notify(&self, trigger: SyncTrigger) {
        if self
            .request_tx
            .try_send((SyncRequest::Sync(trigger), None))
            .is_err()
        {
            debug!(?trigger, "Sync request dropped, worker busy or stopped");
        }
    }

    /// Change the sync mode. A running worker picks it up immediately.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
        self.mode_changed.notify_one();
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the worker after its current cycle.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;
        drop(is_shutdown);

        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Responder)>,
    shutdown: Arc<RwLock<bool>>,
    mode_changed: Arc<Notify>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Cycles run one at a time;
    /// `sync_fn` is never called concurrently.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<SyncResult>> + Send,
    {
        let mut periodic_interval = self.create_periodic_interval().await;

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some((SyncRequest::Sync(trigger), responder)) => {
                            debug!(?trigger, "Processing sync request");
                            let result = sync_fn(trigger).await;
                            log_result(trigger, &result);
                            if let Some(response_tx) = responder {
                                let _ = response_tx.send(result);
                            }
                        }
                        Some((SyncRequest::Shutdown, _)) | None => {
                            info!("Received shutdown request");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    debug!("Triggering periodic sync");
                    let result = sync_fn(SyncTrigger::Scheduled).await;
                    log_result(SyncTrigger::Scheduled, &result);
                }

                _ = self.mode_changed.notified() => {
                    periodic_interval = self.create_periodic_interval().await;
                    debug!(interval = ?periodic_interval.as_ref().map(|i| i.period()), "Sync mode changed");
                }
            }
        }

        info!("Sync scheduler shutting down");
    }

    async fn create_periodic_interval(&self) -> Option<Interval> {
        let period = self.mode.read().await.interval()?;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn log_result(trigger: SyncTrigger, result: &Result<SyncResult>) {
    match result {
        Ok(sync_result) if sync_result.is_skipped() => {
            debug!(?trigger, reason = ?sync_result.skipped, "Sync cycle skipped");
        }
        Ok(sync_result) => {
            info!(
                ?trigger,
                synced = sync_result.changes_synced,
                failed = sync_result.changes_failed,
                conflicts = sync_result.conflicts_found,
                "Sync cycle completed"
            );
        }
        Err(e) => {
            error!(?trigger, error = %e, "Sync cycle failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spawn_counting(handle: SyncSchedulerHandle) -> (Arc<AtomicU32>, tokio::task::JoinHandle<()>) {
        let sync_count = Arc::new(AtomicU32::new(0));
        let count_clone = sync_count.clone();
        let task = tokio::spawn(async move {
            handle
                .run(move |trigger| {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        let mut result = SyncResult::new(trigger);
                        result.changes_synced = 1;
                        Ok(result)
                    }
                })
                .await;
        });
        (sync_count, task)
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        assert_eq!(scheduler.get_mode().await, SyncMode::Manual);

        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_secs(60),
            })
            .await;
        assert!(matches!(scheduler.get_mode().await, SyncMode::Periodic { .. }));
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::OnDemand);
        let (sync_count, task) = spawn_counting(handle);

        let result = scheduler.request_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(result.changes_synced, 1);
        assert_eq!(result.trigger, SyncTrigger::Manual);
        assert_eq!(sync_count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        let _ = task.await;
        assert!(scheduler.request_sync(SyncTrigger::Manual).await.is_err());
    }

    #[tokio::test]
    async fn test_mode_change_starts_periodic_ticks() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (sync_count, task) = spawn_counting(handle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync_count.load(Ordering::SeqCst), 0);

        scheduler
            .set_mode(SyncMode::Periodic {
                interval: Duration::from_millis(10),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sync_count.load(Ordering::SeqCst) >= 2);

        scheduler.shutdown().await;
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_notify_runs_without_waiting() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (sync_count, task) = spawn_counting(handle);

        scheduler.notify(SyncTrigger::NetworkRestored);
        // Requests are processed in order, so this returns after the notify.
        scheduler.request_sync(SyncTrigger::Manual).await.unwrap();
        assert_eq!(sync_count.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
        let _ = task.await;
    }

    #[test]
    fn test_mode_from_strategy() {
        let strategy = SyncStrategy {
            interval: Duration::from_secs(30),
            batch_size: 10,
            real_time: true,
        };
        let mode = SyncMode::from_strategy(&strategy);
        assert!(mode.syncs_on_change());
        assert_eq!(mode.interval(), Some(Duration::from_secs(30)));

        let relaxed = SyncMode::from_strategy(&SyncStrategy {
            real_time: false,
            ..strategy
        });
        assert!(!relaxed.syncs_on_change());
    }

    #[test]
    fn test_trigger_rearm_rules() {
        assert!(!SyncTrigger::Retry.rearms_parked());
        assert!(!SyncTrigger::HighPriorityChange.rearms_parked());
        assert!(SyncTrigger::NetworkRestored.rearms_parked());
        assert!(SyncTrigger::Foreground.rearms_parked());
    }
}
