//! In-memory remote endpoint for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::remote::{ChangeOutcome, PushRequest, RemoteEndpoint, RemoteSnapshot};
use lexisync_common::{Domain, DomainPayload, Error, Result};

#[derive(Debug, Clone)]
struct DomainState {
    payload: Option<DomainPayload>,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl DomainState {
    fn new() -> Self {
        Self {
            payload: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    fn snapshot(&self, domain: &Domain) -> RemoteSnapshot {
        RemoteSnapshot {
            domain: domain.clone(),
            payload: self.payload.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    domains: HashMap<Domain, DomainState>,
    /// change id -> server version it produced
    applied: HashMap<String, u64>,
}

/// In-memory remote endpoint.
///
/// Behaves like the real sync server: per-domain versions, stale-version
/// conflicts, schema validation and idempotent re-delivery. Failure and
/// latency injection let tests exercise the retry and timeout paths.
/// Clones share the same server state.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<ServerState>>,
    push_count: Arc<AtomicUsize>,
    applied_count: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl MemoryRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the server value of a domain, as if another device wrote it.
    ///
    /// # Returns
    /// The new server version of the domain.
    pub fn seed(&self, payload: DomainPayload) -> Result<u64> {
        let mut state = self.lock()?;
        let domain = payload.domain();
        let entry = state
            .domains
            .entry(domain)
            .or_insert_with(DomainState::new);
        entry.payload = Some(payload);
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(entry.version)
    }

    /// Current server value of a domain.
    pub fn snapshot(&self, domain: &Domain) -> Result<RemoteSnapshot> {
        let state = self.lock()?;
        Ok(state
            .domains
            .get(domain)
            .map(|s| s.snapshot(domain))
            .unwrap_or_else(|| DomainState::new().snapshot(domain)))
    }

    /// Number of push requests received, including failed ones.
    pub fn push_count(&self) -> usize {
        self.push_count.load(Ordering::SeqCst)
    }

    /// Number of changes actually applied.
    pub fn applied_count(&self) -> usize {
        self.applied_count.load(Ordering::SeqCst)
    }

    /// Make every push fail with a network error until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next `count` pushes fail with a network error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ServerState>> {
        self.state
            .lock()
            .map_err(|_| Error::Remote("Memory remote lock poisoned".to_string()))
    }

    async fn simulate_latency(&self) {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn should_fail(&self) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteEndpoint for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, request: PushRequest) -> Result<Vec<ChangeOutcome>> {
        self.push_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.should_fail() {
            return Err(Error::Network("Connection refused".to_string()));
        }

        let mut state = self.lock()?;
        let mut batch_base: HashMap<Domain, u64> = HashMap::new();
        let mut outcomes = Vec::with_capacity(request.changes.len());

        for change in request.changes {
            if let Some(version) = state.applied.get(&change.change_id) {
                outcomes.push(ChangeOutcome::AlreadyApplied {
                    change_id: change.change_id,
                    server_version: *version,
                });
                continue;
            }

            let current_version = state
                .domains
                .get(&change.domain)
                .map(|s| s.version)
                .unwrap_or(0);
            let base = *batch_base
                .entry(change.domain.clone())
                .or_insert(current_version);
            let known = request
                .known_versions
                .get(&change.domain)
                .copied()
                .unwrap_or(0);

            if known < base {
                let snapshot = state
                    .domains
                    .get(&change.domain)
                    .map(|s| s.snapshot(&change.domain))
                    .unwrap_or_else(|| DomainState::new().snapshot(&change.domain));
                outcomes.push(ChangeOutcome::Conflict {
                    change_id: change.change_id,
                    server: snapshot,
                });
                continue;
            }

            if let Err(e) = change.payload.validate_for(&change.domain) {
                outcomes.push(ChangeOutcome::Rejected {
                    change_id: change.change_id,
                    reason: e.to_string(),
                });
                continue;
            }

            let entry = state
                .domains
                .entry(change.domain.clone())
                .or_insert_with(DomainState::new);
            let payload = entry
                .payload
                .get_or_insert_with(|| DomainPayload::empty(&change.domain));
            if let Err(e) = payload.apply(change.operation, &change.payload) {
                outcomes.push(ChangeOutcome::Rejected {
                    change_id: change.change_id,
                    reason: e.to_string(),
                });
                continue;
            }
            entry.version += 1;
            entry.updated_at = Utc::now();
            let server_version = entry.version;

            debug!(
                change_id = %change.change_id,
                domain = %change.domain,
                server_version,
                "Memory remote applied change"
            );
            state.applied.insert(change.change_id.clone(), server_version);
            self.applied_count.fetch_add(1, Ordering::SeqCst);
            outcomes.push(ChangeOutcome::Applied {
                change_id: change.change_id,
                server_version,
            });
        }

        Ok(outcomes)
    }

    async fn fetch(&self, domain: &Domain) -> Result<RemoteSnapshot> {
        self.simulate_latency().await;
        self.snapshot(domain)
    }
}
