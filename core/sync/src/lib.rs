//! LexiSync Sync Engine
//!
//! Offline-first synchronization of learning data, including:
//! - Durable change recording with per-domain versions
//! - Delivery with exponential backoff and quarantine of bad changes
//! - Domain-aware conflict resolution
//! - Scheduling driven by an adaptive strategy

pub mod activity;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod merge;
pub mod network;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod strategy;

// Re-export main types
pub use activity::{ActivityAssessment, ActivityLevel, ActivityMonitor};
pub use conflict::{
    Confidence, Conflict, ConflictPolicy, ConflictResolver, ConflictSeverity, Resolution,
    ResolutionSource,
};
pub use engine::{SyncConfig, SyncEngine, SyncStatusSnapshot};
pub use events::{EventBus, SyncEvent};
pub use network::{ConnectivityProbe, NetworkType, SharedConnectivity};
pub use queue::{Appended, PendingChange, PendingQueue};
pub use recorder::{ChangeInput, ChangeRecorder};
pub use retry::{with_timeout, RetryConfig, RetryExecutor};
pub use scheduler::{
    SkipReason, SyncMode, SyncRequest, SyncResult, SyncScheduler, SyncSchedulerHandle,
    SyncTrigger,
};
pub use snapshot::LocalSnapshots;
pub use state::{StoreKeys, SyncMetadata, SyncStats, SyncStatus};
pub use strategy::{StrategyConfig, StrategySelector, SyncContext, SyncStrategy};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _retry_config = RetryConfig::default();
        let _resolver = ConflictResolver::default();
        let _metadata = SyncMetadata::new();
        let _selector = StrategySelector::default();
        let _monitor = ActivityMonitor::default();
    }
}
