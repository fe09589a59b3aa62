//! Sync events broadcast to UI observers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use lexisync_common::Domain;

use crate::conflict::{Confidence, ConflictSeverity, ResolutionSource};
use crate::scheduler::SyncResult;
use crate::state::SyncStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged {
        status: SyncStatus,
    },
    ChangeRecorded {
        change_id: String,
        domain: Domain,
        local_version: u64,
    },
    ChangeDelivered {
        change_id: String,
        domain: Domain,
        server_version: u64,
    },
    ConflictResolved {
        domain: Domain,
        source: ResolutionSource,
        confidence: Confidence,
        severity: ConflictSeverity,
    },
    /// A change was quarantined and will not be retried automatically.
    ChangeBlocked {
        change_id: String,
        domain: Domain,
        reason: String,
    },
    SyncCompleted {
        result: SyncResult,
    },
    SyncFailed {
        error: String,
    },
}

/// Fan-out of [`SyncEvent`]s. Slow receivers miss events rather than
/// holding up the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::SyncFailed {
            error: "nobody listening".into(),
        });

        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::StatusChanged {
            status: SyncStatus::Syncing,
        });

        match rx.recv().await.unwrap() {
            SyncEvent::StatusChanged { status } => assert_eq!(status, SyncStatus::Syncing),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(SyncEvent::ChangeBlocked {
            change_id: "c1".into(),
            domain: Domain::Vocabulary,
            reason: "duplicate key".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "change_blocked");
        assert_eq!(json["domain"], "vocabulary");
    }
}
