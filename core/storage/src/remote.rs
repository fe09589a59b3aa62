//! Remote sync endpoint trait and wire protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use lexisync_common::{ChangeOperation, Domain, DomainPayload, Result};

/// One change as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEnvelope {
    pub change_id: String,
    pub domain: Domain,
    pub operation: ChangeOperation,
    pub payload: DomainPayload,
    pub local_version: u64,
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

/// A batch of changes plus the client's last-known server version per domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub changes: Vec<ChangeEnvelope>,
    pub known_versions: BTreeMap<Domain, u64>,
}

/// Current server-side state of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub domain: Domain,
    /// `None` when the server has never seen the domain.
    pub payload: Option<DomainPayload>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-change result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeOutcome {
    /// The change was applied.
    Applied {
        change_id: String,
        server_version: u64,
    },
    /// The change id was applied by an earlier delivery; nothing was done.
    AlreadyApplied {
        change_id: String,
        server_version: u64,
    },
    /// The change was based on a stale version of its domain.
    Conflict {
        change_id: String,
        server: RemoteSnapshot,
    },
    /// The server refused the change and will keep refusing it.
    Rejected { change_id: String, reason: String },
}

impl ChangeOutcome {
    /// Id of the change this outcome refers to.
    pub fn change_id(&self) -> &str {
        match self {
            ChangeOutcome::Applied { change_id, .. }
            | ChangeOutcome::AlreadyApplied { change_id, .. }
            | ChangeOutcome::Conflict { change_id, .. }
            | ChangeOutcome::Rejected { change_id, .. } => change_id,
        }
    }

    /// Whether the server now holds the change.
    pub fn is_acknowledged(&self) -> bool {
        matches!(
            self,
            ChangeOutcome::Applied { .. } | ChangeOutcome::AlreadyApplied { .. }
        )
    }
}

/// Remote system of record.
///
/// Transport details (verbs, auth headers, retries at the HTTP layer) belong
/// to the implementation. The engine only needs "send a batch, get a
/// per-item outcome" and "read the current value of a domain".
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Get the endpoint name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Deliver a batch of changes.
    ///
    /// # Returns
    /// One outcome per change, in any order.
    ///
    /// # Errors
    /// - `Network` / `Timeout` for transport failures (retryable)
    /// - `Authentication` / `Remote` for refusals of the whole request
    async fn push(&self, request: PushRequest) -> Result<Vec<ChangeOutcome>>;

    /// Fetch the current server value of a domain.
    async fn fetch(&self, domain: &Domain) -> Result<RemoteSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexisync_common::ExperienceData;

    #[test]
    fn test_outcome_wire_format() {
        let outcome = ChangeOutcome::Conflict {
            change_id: "c1".into(),
            server: RemoteSnapshot {
                domain: Domain::Experience,
                payload: Some(DomainPayload::Experience(ExperienceData {
                    experience: 150,
                    level: 2,
                })),
                version: 2,
                updated_at: Utc::now(),
            },
        };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "conflict");
        assert_eq!(json["server"]["domain"], "experience");
        assert_eq!(json["server"]["version"], 2);

        let restored: ChangeOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(restored.change_id(), "c1");
        assert!(!restored.is_acknowledged());
    }

    #[test]
    fn test_push_request_known_versions() {
        let mut request = PushRequest::default();
        request.known_versions.insert(Domain::Vocabulary, 7);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["knownVersions"]["vocabulary"], 7);
    }
}
