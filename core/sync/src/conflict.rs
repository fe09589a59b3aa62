//! Conflict detection and resolution.
//!
//! The resolver is pure: it never touches storage or the network. Given the
//! local and server values of one domain it decides which value the domain
//! should hold afterwards and how sure it is about that choice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use lexisync_common::payload::Keyed;
use lexisync_common::{Domain, DomainPayload, Error, Result};

use crate::merge::{self, Newer};

/// A disagreement between the local and server value of a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub domain: Domain,
    pub local_data: DomainPayload,
    pub server_data: DomainPayload,
    /// Time of the newest local change involved.
    pub local_timestamp: DateTime<Utc>,
    /// Last server-side update of the domain.
    pub server_timestamp: DateTime<Utc>,
}

impl Conflict {
    fn newer(&self) -> Newer {
        if self.server_timestamp > self.local_timestamp {
            Newer::Server
        } else {
            Newer::Local
        }
    }
}

/// Where the resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Local,
    Server,
    Merged,
}

/// How safe the resolution is to apply without user review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Magnitude of a conflict. Reported in events and logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_data: DomainPayload,
    pub source: ResolutionSource,
    pub confidence: Confidence,
    pub reason: String,
}

/// Per-domain resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Every numeric field takes its highest value.
    HighestValueWins,
    /// Keyed union of collection entries.
    MergeUnion,
    /// Keyed union keeping the earliest unlock.
    AchievementUnion,
    /// Numeric values merge by max, anything else by latest timestamp.
    Generic,
}

/// Conflict detector and resolver.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    overrides: BTreeMap<Domain, ConflictPolicy>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `policy` for `domain` instead of the built-in one.
    pub fn with_policy(mut self, domain: Domain, policy: ConflictPolicy) -> Self {
        self.overrides.insert(domain, policy);
        self
    }

    /// Policy applied to `domain`.
    pub fn policy_for(&self, domain: &Domain) -> ConflictPolicy {
        if let Some(policy) = self.overrides.get(domain) {
            return *policy;
        }
        match domain {
            Domain::Experience | Domain::UserStats | Domain::Progress => {
                ConflictPolicy::HighestValueWins
            }
            Domain::Vocabulary | Domain::LearningRecords => ConflictPolicy::MergeUnion,
            Domain::Achievements => ConflictPolicy::AchievementUnion,
            Domain::Custom(_) => ConflictPolicy::Generic,
        }
    }

    /// Shallow inequality check. Collections compare as keyed sets, so two
    /// lists holding the same entries in a different order do not conflict.
    pub fn has_conflict(&self, local: &DomainPayload, server: &DomainPayload, domain: &Domain) -> bool {
        if &local.domain() != domain || &server.domain() != domain {
            return true;
        }
        match (local, server) {
            (DomainPayload::Vocabulary(l), DomainPayload::Vocabulary(s)) => {
                !same_entries(&l.words, &s.words)
            }
            (DomainPayload::LearningRecords(l), DomainPayload::LearningRecords(s)) => {
                !same_entries(&l.records, &s.records)
            }
            (DomainPayload::Achievements(l), DomainPayload::Achievements(s)) => {
                !same_entries(&l.achievements, &s.achievements)
            }
            _ => local != server,
        }
    }

    /// Rough size of the disagreement.
    pub fn conflict_severity(&self, conflict: &Conflict) -> ConflictSeverity {
        let local = &conflict.local_data;
        let server = &conflict.server_data;
        if !self.has_conflict(local, server, &conflict.domain) {
            return ConflictSeverity::Low;
        }

        let ratio = match (local, server) {
            (DomainPayload::Vocabulary(l), DomainPayload::Vocabulary(s)) => {
                keyed_divergence(&l.words, &s.words)
            }
            (DomainPayload::LearningRecords(l), DomainPayload::LearningRecords(s)) => {
                keyed_divergence(&l.records, &s.records)
            }
            (DomainPayload::Achievements(l), DomainPayload::Achievements(s)) => {
                keyed_divergence(&l.achievements, &s.achievements)
            }
            _ => match (local.to_value(), server.to_value()) {
                (Ok(l), Ok(s)) => numeric_divergence(&l, &s).unwrap_or(0.5),
                _ => 1.0,
            },
        };

        if ratio <= 0.1 {
            ConflictSeverity::Low
        } else if ratio <= 0.5 {
            ConflictSeverity::Medium
        } else {
            ConflictSeverity::High
        }
    }

    /// Resolve a conflict according to the domain's policy.
    ///
    /// # Errors
    /// `Validation` when either side does not belong to the conflict's domain.
    pub fn resolve(&self, conflict: &Conflict) -> Result<Resolution> {
        conflict.local_data.validate_for(&conflict.domain).map_err(|e| {
            Error::Validation(format!("local side of conflict is invalid: {}", e))
        })?;
        if conflict.server_data.domain() != conflict.domain {
            return Err(Error::Validation(format!(
                "server side of conflict belongs to '{}'",
                conflict.server_data.domain()
            )));
        }

        let resolution = match self.policy_for(&conflict.domain) {
            ConflictPolicy::HighestValueWins => self.highest_value(conflict),
            ConflictPolicy::MergeUnion | ConflictPolicy::AchievementUnion => self.union(conflict),
            ConflictPolicy::Generic => self.generic(conflict),
        };

        Ok(resolution.unwrap_or_else(|| latest_wins(conflict)))
    }

    fn highest_value(&self, conflict: &Conflict) -> Option<Resolution> {
        let resolved = match (&conflict.local_data, &conflict.server_data) {
            (DomainPayload::Experience(l), DomainPayload::Experience(s)) => {
                DomainPayload::Experience(merge::experience(l, s))
            }
            (DomainPayload::UserStats(l), DomainPayload::UserStats(s)) => {
                DomainPayload::UserStats(merge::user_stats(l, s))
            }
            (DomainPayload::Progress(l), DomainPayload::Progress(s)) => {
                DomainPayload::Progress(merge::progress(l, s))
            }
            _ => return self.generic(conflict),
        };
        Some(classify(
            conflict,
            resolved,
            Confidence::High,
            "highest value wins",
        ))
    }

    fn union(&self, conflict: &Conflict) -> Option<Resolution> {
        let newer = conflict.newer();
        let (resolved, ambiguous) = match (&conflict.local_data, &conflict.server_data) {
            (DomainPayload::Vocabulary(l), DomainPayload::Vocabulary(s)) => {
                let merged = merge::vocabulary(l, s, newer);
                (DomainPayload::Vocabulary(merged.value), merged.ambiguous)
            }
            (DomainPayload::LearningRecords(l), DomainPayload::LearningRecords(s)) => {
                let merged = merge::learning_records(l, s, newer);
                (DomainPayload::LearningRecords(merged.value), merged.ambiguous)
            }
            (DomainPayload::Achievements(l), DomainPayload::Achievements(s)) => {
                let merged = merge::achievements(l, s);
                (DomainPayload::Achievements(merged.value), merged.ambiguous)
            }
            _ => return self.generic(conflict),
        };

        let confidence = if ambiguous {
            Confidence::Medium
        } else {
            Confidence::High
        };
        Some(classify(conflict, resolved, confidence, "keyed union"))
    }

    fn generic(&self, conflict: &Conflict) -> Option<Resolution> {
        let local = conflict.local_data.to_value().ok()?;
        let server = conflict.server_data.to_value().ok()?;
        let merged = merge::json_numeric(&local, &server)?;
        let resolved = DomainPayload::from_value(&conflict.domain, merged).ok()?;
        Some(classify(
            conflict,
            resolved,
            Confidence::Medium,
            "highest numeric value wins",
        ))
    }
}

/// Label a merged value by which side it matches.
fn classify(
    conflict: &Conflict,
    resolved: DomainPayload,
    confidence: Confidence,
    policy: &str,
) -> Resolution {
    let matches_local = resolved == conflict.local_data;
    let matches_server = resolved == conflict.server_data;

    let source = match (matches_local, matches_server) {
        (true, true) => match conflict.newer() {
            Newer::Server => ResolutionSource::Server,
            Newer::Local => ResolutionSource::Local,
        },
        (true, false) => ResolutionSource::Local,
        (false, true) => ResolutionSource::Server,
        (false, false) => ResolutionSource::Merged,
    };

    Resolution {
        resolved_data: resolved,
        source,
        confidence,
        reason: format!("{}: {:?} value kept for {}", policy, source, conflict.domain),
    }
}

/// Fallback when no value-based merge exists.
fn latest_wins(conflict: &Conflict) -> Resolution {
    let (resolved_data, source) = match conflict.newer() {
        Newer::Server => (conflict.server_data.clone(), ResolutionSource::Server),
        Newer::Local => (conflict.local_data.clone(), ResolutionSource::Local),
    };
    Resolution {
        resolved_data,
        source,
        confidence: Confidence::Low,
        reason: format!("latest timestamp wins for {}", conflict.domain),
    }
}

fn same_entries<T: Keyed + PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|x| b.iter().any(|y| y.key() == x.key() && y == x))
}

/// Share of keys that exist on one side only or differ in content.
fn keyed_divergence<T: Keyed + PartialEq>(a: &[T], b: &[T]) -> f64 {
    let mut keys: Vec<&str> = a.iter().chain(b.iter()).map(|e| e.key()).collect();
    keys.sort_unstable();
    keys.dedup();
    if keys.is_empty() {
        return 0.0;
    }

    let differing = keys
        .iter()
        .filter(|key| {
            let x = a.iter().find(|e| e.key() == **key);
            let y = b.iter().find(|e| e.key() == **key);
            x != y
        })
        .count();
    differing as f64 / keys.len() as f64
}

/// Largest relative difference between numeric values.
fn numeric_divergence(a: &serde_json::Value, b: &serde_json::Value) -> Option<f64> {
    use serde_json::Value;

    fn relative(x: f64, y: f64) -> f64 {
        let scale = x.abs().max(y.abs());
        if scale == 0.0 {
            0.0
        } else {
            (x - y).abs() / scale
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Some(relative(x.as_f64()?, y.as_f64()?)),
        (Value::Object(x), Value::Object(y)) => {
            let mut worst: Option<f64> = None;
            for (key, xv) in x {
                if let Some(yv) = y.get(key) {
                    let d = numeric_divergence(xv, yv)?;
                    worst = Some(worst.map_or(d, |w: f64| w.max(d)));
                }
            }
            worst.or(Some(0.0))
        }
        _ if a == b => Some(0.0),
        _ => None,
    }
}
