//! Typed domain payloads.
//!
//! Every synchronizable domain has a typed snapshot value. A change carries a
//! payload of the same shape: for collection domains it names the entries it
//! touches, for scalar domains it carries the new value. The same
//! [`DomainPayload::apply`] logic is used for the local snapshot and by the
//! in-memory remote, so both sides agree on what an operation means.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::types::{ChangeOperation, Domain};
use crate::{Error, Result};

/// A single entry in an item's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    /// What happened, e.g. "review_correct" or "lesson_completed".
    pub action: String,
}

/// Experience points and derived level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperienceData {
    pub experience: u64,
    pub level: u32,
}

impl Default for ExperienceData {
    fn default() -> Self {
        Self {
            experience: 0,
            level: 1,
        }
    }
}

/// Named monotonic progress counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressData {
    pub counters: BTreeMap<String, u64>,
}

/// Aggregate statistics for the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStatsData {
    pub words_learned: u64,
    pub reviews_completed: u64,
    pub current_streak: u64,
    pub longest_streak: u64,
    pub study_minutes: u64,
    pub lessons_completed: u64,
}

/// One word in the vocabulary collection, keyed by `word`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub word: String,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub correct_count: u32,
    #[serde(default)]
    pub incorrect_count: u32,
    #[serde(default)]
    pub mastery_level: u32,
    #[serde(default)]
    pub last_reviewed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl VocabularyEntry {
    /// A freshly added word with no review history.
    pub fn new(word: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            translation: None,
            correct_count: 0,
            incorrect_count: 0,
            mastery_level: 0,
            last_reviewed: None,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyData {
    pub words: Vec<VocabularyEntry>,
}

/// A completed or in-progress learning activity, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningRecordsData {
    pub records: Vec<LearningRecord>,
}

/// An achievement, keyed by `id`. `unlocked_at` is `None` while locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: String,
    #[serde(default)]
    pub unlocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: u32,
    pub target: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementsData {
    pub achievements: Vec<Achievement>,
}

/// Entries of a collection domain, identified by a natural key.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for VocabularyEntry {
    fn key(&self) -> &str {
        &self.word
    }
}

impl Keyed for LearningRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Achievement {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Typed value of a domain, tagged by domain name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "data", rename_all = "snake_case")]
pub enum DomainPayload {
    Experience(ExperienceData),
    Vocabulary(VocabularyData),
    Progress(ProgressData),
    Achievements(AchievementsData),
    UserStats(UserStatsData),
    LearningRecords(LearningRecordsData),
    /// Value of a domain this build has no schema for.
    Opaque {
        name: String,
        value: serde_json::Value,
    },
}

impl DomainPayload {
    /// The domain this payload belongs to.
    pub fn domain(&self) -> Domain {
        match self {
            DomainPayload::Experience(_) => Domain::Experience,
            DomainPayload::Vocabulary(_) => Domain::Vocabulary,
            DomainPayload::Progress(_) => Domain::Progress,
            DomainPayload::Achievements(_) => Domain::Achievements,
            DomainPayload::UserStats(_) => Domain::UserStats,
            DomainPayload::LearningRecords(_) => Domain::LearningRecords,
            DomainPayload::Opaque { name, .. } => Domain::parse(name),
        }
    }

    /// The empty snapshot for a domain.
    pub fn empty(domain: &Domain) -> Self {
        match domain {
            Domain::Experience => DomainPayload::Experience(ExperienceData::default()),
            Domain::Vocabulary => DomainPayload::Vocabulary(VocabularyData::default()),
            Domain::Progress => DomainPayload::Progress(ProgressData::default()),
            Domain::Achievements => DomainPayload::Achievements(AchievementsData::default()),
            Domain::UserStats => DomainPayload::UserStats(UserStatsData::default()),
            Domain::LearningRecords => {
                DomainPayload::LearningRecords(LearningRecordsData::default())
            }
            Domain::Custom(name) => DomainPayload::Opaque {
                name: name.clone(),
                value: serde_json::Value::Null,
            },
        }
    }

    /// Build a payload for `domain` from an untyped JSON value.
    pub fn from_value(domain: &Domain, value: serde_json::Value) -> Result<Self> {
        let payload = match domain {
            Domain::Experience => DomainPayload::Experience(serde_json::from_value(value)?),
            Domain::Vocabulary => DomainPayload::Vocabulary(serde_json::from_value(value)?),
            Domain::Progress => DomainPayload::Progress(serde_json::from_value(value)?),
            Domain::Achievements => DomainPayload::Achievements(serde_json::from_value(value)?),
            Domain::UserStats => DomainPayload::UserStats(serde_json::from_value(value)?),
            Domain::LearningRecords => {
                DomainPayload::LearningRecords(serde_json::from_value(value)?)
            }
            Domain::Custom(name) => DomainPayload::Opaque {
                name: name.clone(),
                value,
            },
        };
        Ok(payload)
    }

    /// Untyped JSON view of the inner value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            DomainPayload::Experience(data) => serde_json::to_value(data)?,
            DomainPayload::Vocabulary(data) => serde_json::to_value(data)?,
            DomainPayload::Progress(data) => serde_json::to_value(data)?,
            DomainPayload::Achievements(data) => serde_json::to_value(data)?,
            DomainPayload::UserStats(data) => serde_json::to_value(data)?,
            DomainPayload::LearningRecords(data) => serde_json::to_value(data)?,
            DomainPayload::Opaque { value, .. } => value.clone(),
        };
        Ok(value)
    }

    /// Deterministic content hash: Blake2b-256 over the JSON encoding, hex encoded.
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Check the payload against its domain schema.
    pub fn validate(&self) -> Result<()> {
        match self {
            DomainPayload::Experience(data) => {
                if data.level == 0 {
                    return Err(Error::Validation("experience level must be >= 1".into()));
                }
                Ok(())
            }
            DomainPayload::Vocabulary(data) => validate_keys("vocabulary", &data.words),
            DomainPayload::LearningRecords(data) => {
                validate_keys("learning_records", &data.records)
            }
            DomainPayload::Achievements(data) => {
                validate_keys("achievements", &data.achievements)?;
                if let Some(bad) = data.achievements.iter().find(|a| a.target == 0) {
                    return Err(Error::Validation(format!(
                        "achievement '{}' has a zero target",
                        bad.id
                    )));
                }
                Ok(())
            }
            DomainPayload::Progress(data) => {
                if data.counters.keys().any(|k| k.is_empty()) {
                    return Err(Error::Validation("progress counter with empty name".into()));
                }
                Ok(())
            }
            DomainPayload::UserStats(_) => Ok(()),
            DomainPayload::Opaque { name, .. } => {
                if name.is_empty() {
                    return Err(Error::Validation("opaque payload without a domain".into()));
                }
                Ok(())
            }
        }
    }

    /// Check the payload belongs to `domain` and satisfies its schema.
    pub fn validate_for(&self, domain: &Domain) -> Result<()> {
        if &self.domain() != domain {
            return Err(Error::Validation(format!(
                "payload for '{}' recorded under '{}'",
                self.domain(),
                domain
            )));
        }
        self.validate()
    }

    /// Natural keys of the entries in a collection payload.
    pub fn entry_keys(&self) -> Vec<String> {
        match self {
            DomainPayload::Vocabulary(data) => keys_of(&data.words),
            DomainPayload::LearningRecords(data) => keys_of(&data.records),
            DomainPayload::Achievements(data) => keys_of(&data.achievements),
            DomainPayload::Progress(data) => data.counters.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Apply a change of `operation` carrying `change` to this snapshot.
    ///
    /// Collection domains upsert (create/update) or remove (delete) the keyed
    /// entries named by the change. Scalar domains take the new value, or
    /// reset to empty on delete.
    pub fn apply(&mut self, operation: ChangeOperation, change: &DomainPayload) -> Result<()> {
        if self.domain() != change.domain() {
            return Err(Error::InvalidInput(format!(
                "cannot apply a '{}' change to a '{}' snapshot",
                change.domain(),
                self.domain()
            )));
        }

        let delete = operation == ChangeOperation::Delete;
        match (self, change) {
            (DomainPayload::Vocabulary(base), DomainPayload::Vocabulary(change)) => {
                apply_keyed(&mut base.words, &change.words, delete)
            }
            (DomainPayload::LearningRecords(base), DomainPayload::LearningRecords(change)) => {
                apply_keyed(&mut base.records, &change.records, delete)
            }
            (DomainPayload::Achievements(base), DomainPayload::Achievements(change)) => {
                apply_keyed(&mut base.achievements, &change.achievements, delete)
            }
            (DomainPayload::Progress(base), DomainPayload::Progress(change)) => {
                for (name, value) in &change.counters {
                    if delete {
                        base.counters.remove(name);
                    } else {
                        base.counters.insert(name.clone(), *value);
                    }
                }
            }
            (target, change) => {
                *target = if delete {
                    DomainPayload::empty(&change.domain())
                } else {
                    change.clone()
                };
            }
        }
        Ok(())
    }
}

fn keys_of<T: Keyed>(items: &[T]) -> Vec<String> {
    items.iter().map(|item| item.key().to_string()).collect()
}

fn validate_keys<T: Keyed>(domain: &str, items: &[T]) -> Result<()> {
    let mut seen = HashSet::new();
    for item in items {
        if item.key().is_empty() {
            return Err(Error::Validation(format!("{} entry with empty key", domain)));
        }
        if !seen.insert(item.key()) {
            return Err(Error::Validation(format!(
                "{} entry '{}' appears twice",
                domain,
                item.key()
            )));
        }
    }
    Ok(())
}

fn apply_keyed<T: Keyed + Clone>(base: &mut Vec<T>, change: &[T], delete: bool) {
    for item in change {
        let existing = base.iter().position(|b| b.key() == item.key());
        match (existing, delete) {
            (Some(index), true) => {
                base.remove(index);
            }
            (Some(index), false) => base[index] = item.clone(),
            (None, false) => base.push(item.clone()),
            (None, true) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(words: &[&str]) -> DomainPayload {
        DomainPayload::Vocabulary(VocabularyData {
            words: words.iter().map(|w| VocabularyEntry::new(*w)).collect(),
        })
    }

    #[test]
    fn test_payload_tagging() {
        let payload = DomainPayload::Experience(ExperienceData {
            experience: 120,
            level: 2,
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["domain"], "experience");
        assert_eq!(json["data"]["experience"], 120);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let a = vocab(&["hola", "adios"]);
        let b = vocab(&["hola", "adios"]);
        let c = vocab(&["hola"]);

        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        assert_ne!(a.checksum().unwrap(), c.checksum().unwrap());
        assert_eq!(a.checksum().unwrap().len(), 64);
    }

    #[test]
    fn test_apply_upsert_and_delete() {
        let mut snapshot = DomainPayload::empty(&Domain::Vocabulary);
        snapshot.apply(ChangeOperation::Create, &vocab(&["a", "b"])).unwrap();
        snapshot.apply(ChangeOperation::Delete, &vocab(&["a"])).unwrap();
        assert_eq!(snapshot.entry_keys(), vec!["b".to_string()]);

        let mut updated = VocabularyEntry::new("b");
        updated.correct_count = 4;
        let change = DomainPayload::Vocabulary(VocabularyData {
            words: vec![updated],
        });
        snapshot.apply(ChangeOperation::Update, &change).unwrap();
        match snapshot {
            DomainPayload::Vocabulary(data) => assert_eq!(data.words[0].correct_count, 4),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_apply_scalar_delete_resets() {
        let mut snapshot = DomainPayload::Experience(ExperienceData {
            experience: 500,
            level: 4,
        });
        snapshot
            .apply(ChangeOperation::Delete, &DomainPayload::empty(&Domain::Experience))
            .unwrap();
        assert_eq!(snapshot, DomainPayload::Experience(ExperienceData::default()));
    }

    #[test]
    fn test_apply_rejects_other_domain() {
        let mut snapshot = DomainPayload::empty(&Domain::Progress);
        assert!(snapshot.apply(ChangeOperation::Update, &vocab(&["x"])).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(vocab(&["a", "b"]).validate().is_ok());
        assert!(vocab(&["a", "a"]).validate().is_err());
        assert!(vocab(&[""]).validate().is_err());

        let achievements = DomainPayload::Achievements(AchievementsData {
            achievements: vec![Achievement {
                id: "first_lesson".into(),
                unlocked_at: None,
                progress: 0,
                target: 0,
            }],
        });
        assert!(achievements.validate().is_err());

        assert!(vocab(&["a"]).validate_for(&Domain::Progress).is_err());
    }

    #[test]
    fn test_from_value_for_custom_domain() {
        let domain = Domain::Custom("notes".into());
        let payload = DomainPayload::from_value(&domain, serde_json::json!({"n": 1})).unwrap();
        assert_eq!(payload.domain(), domain);
        assert_eq!(payload.to_value().unwrap()["n"], 1);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn create_then_delete_leaves_nothing(words in proptest::collection::hash_set("[a-z]{1,8}", 0..12)) {
                let words: Vec<&str> = words.iter().map(|w| w.as_str()).collect();
                let change = vocab(&words);
                let mut snapshot = DomainPayload::empty(&Domain::Vocabulary);
                snapshot.apply(ChangeOperation::Create, &change).unwrap();
                prop_assert_eq!(snapshot.entry_keys().len(), words.len());
                snapshot.apply(ChangeOperation::Delete, &change).unwrap();
                prop_assert!(snapshot.entry_keys().is_empty());
            }
        }
    }
}
