//! Common types used throughout lexisync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named category of synchronizable data.
///
/// Domains serialize as lowercase strings so they can be used as JSON map
/// keys. Names that are not recognized round-trip as [`Domain::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Domain {
    /// Experience points and level.
    Experience,
    /// The user's word collection.
    Vocabulary,
    /// Named progress counters.
    Progress,
    /// Unlockable achievements.
    Achievements,
    /// Aggregate learning statistics.
    UserStats,
    /// Free-form learning records (lessons, quizzes, ...).
    LearningRecords,
    /// A domain this build does not know about.
    Custom(String),
}

impl Domain {
    /// All domains with a typed payload.
    pub const KNOWN: [Domain; 6] = [
        Domain::Experience,
        Domain::Vocabulary,
        Domain::Progress,
        Domain::Achievements,
        Domain::UserStats,
        Domain::LearningRecords,
    ];

    /// Parse a domain name. Never fails; unknown names become `Custom`.
    pub fn parse(name: &str) -> Self {
        match name {
            "experience" => Domain::Experience,
            "vocabulary" => Domain::Vocabulary,
            "progress" => Domain::Progress,
            "achievements" => Domain::Achievements,
            "user_stats" => Domain::UserStats,
            "learning_records" => Domain::LearningRecords,
            other => Domain::Custom(other.to_string()),
        }
    }

    /// Wire name of the domain.
    pub fn as_str(&self) -> &str {
        match self {
            Domain::Experience => "experience",
            Domain::Vocabulary => "vocabulary",
            Domain::Progress => "progress",
            Domain::Achievements => "achievements",
            Domain::UserStats => "user_stats",
            Domain::LearningRecords => "learning_records",
            Domain::Custom(name) => name,
        }
    }

    /// Whether the domain holds a keyed collection rather than a single value.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Domain::Vocabulary | Domain::Achievements | Domain::LearningRecords
        )
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Domain {
    fn from(name: String) -> Self {
        Domain::parse(&name)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.as_str().to_string()
    }
}

/// Kind of mutation carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// New data.
    Create,
    /// Modified data.
    Update,
    /// Removed data.
    Delete,
}

impl ChangeOperation {
    /// Position in the per-domain delivery order: deletes, then updates, then creates.
    pub fn apply_rank(self) -> u8 {
        match self {
            ChangeOperation::Delete => 0,
            ChangeOperation::Update => 1,
            ChangeOperation::Create => 2,
        }
    }

    /// Parse an operation name (case-insensitive).
    pub fn parse(name: &str) -> crate::Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "create" => Ok(ChangeOperation::Create),
            "update" => Ok(ChangeOperation::Update),
            "delete" => Ok(ChangeOperation::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_domain_parse_known_and_custom() {
        for domain in Domain::KNOWN {
            assert_eq!(Domain::parse(domain.as_str()), domain);
        }
        assert_eq!(
            Domain::parse("flashcard_decks"),
            Domain::Custom("flashcard_decks".to_string())
        );
    }

    #[test]
    fn test_domain_as_map_key() {
        let mut versions = BTreeMap::new();
        versions.insert(Domain::UserStats, 3u64);
        versions.insert(Domain::Custom("notes".to_string()), 7u64);

        let json = serde_json::to_string(&versions).unwrap();
        assert!(json.contains("\"user_stats\":3"));

        let restored: BTreeMap<Domain, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, versions);
    }

    #[test]
    fn test_operation_rank_orders_deletes_first() {
        let mut ops = vec![
            ChangeOperation::Create,
            ChangeOperation::Delete,
            ChangeOperation::Update,
        ];
        ops.sort_by_key(|op| op.apply_rank());
        assert_eq!(
            ops,
            vec![
                ChangeOperation::Delete,
                ChangeOperation::Update,
                ChangeOperation::Create
            ]
        );
    }

    #[test]
    fn test_duration_ms_adapter() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_ms")]
            delay: std::time::Duration,
        }

        let json = serde_json::to_string(&Wrapper {
            delay: std::time::Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json, "{\"delay\":1500}");
        let restored: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.delay.as_millis(), 1500);
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!(ChangeOperation::parse("Update").unwrap(), ChangeOperation::Update);
        assert!(ChangeOperation::parse("upsert").is_err());
    }
}
