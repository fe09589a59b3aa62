//! Field-level merge functions used by the conflict resolver.
//!
//! Counters only grow on any device, so numeric fields merge with `max`.
//! Collections merge as a keyed union. Fields that can legitimately move
//! in both directions (translations, kinds, targets) take the newer side
//! and flag the merge as ambiguous.

use serde_json::{Map, Value};
use std::collections::HashSet;

use lexisync_common::payload::{
    Achievement, AchievementsData, ExperienceData, HistoryEvent, Keyed, LearningRecord,
    LearningRecordsData, ProgressData, UserStatsData, VocabularyData, VocabularyEntry,
};

/// Which side wins fields that cannot be merged by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Newer {
    Local,
    Server,
}

/// A merged value and whether a choice had to be made between differing
/// non-monotonic fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged<T> {
    pub value: T,
    pub ambiguous: bool,
}

impl<T> Merged<T> {
    fn clean(value: T) -> Self {
        Self {
            value,
            ambiguous: false,
        }
    }
}

pub fn experience(local: &ExperienceData, server: &ExperienceData) -> ExperienceData {
    ExperienceData {
        experience: local.experience.max(server.experience),
        level: local.level.max(server.level),
    }
}

pub fn user_stats(local: &UserStatsData, server: &UserStatsData) -> UserStatsData {
    UserStatsData {
        words_learned: local.words_learned.max(server.words_learned),
        reviews_completed: local.reviews_completed.max(server.reviews_completed),
        current_streak: local.current_streak.max(server.current_streak),
        longest_streak: local.longest_streak.max(server.longest_streak),
        study_minutes: local.study_minutes.max(server.study_minutes),
        lessons_completed: local.lessons_completed.max(server.lessons_completed),
    }
}

/// Union of counters, each at its highest value.
pub fn progress(local: &ProgressData, server: &ProgressData) -> ProgressData {
    let mut counters = local.counters.clone();
    for (name, value) in &server.counters {
        let entry = counters.entry(name.clone()).or_insert(0);
        *entry = (*entry).max(*value);
    }
    ProgressData { counters }
}

/// Union of two histories, deduplicated by `(timestamp, action)` and sorted
/// by time.
pub fn history(local: &[HistoryEvent], server: &[HistoryEvent]) -> Vec<HistoryEvent> {
    let mut seen = HashSet::new();
    let mut merged: Vec<HistoryEvent> = local
        .iter()
        .chain(server.iter())
        .filter(|event| seen.insert((event.timestamp, event.action.clone())))
        .cloned()
        .collect();
    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    merged
}

/// Keyed union. Local order first, then server-only entries in server order.
fn union_keyed<T, F>(local: &[T], server: &[T], merge: F) -> Merged<Vec<T>>
where
    T: Keyed + Clone,
    F: Fn(&T, &T) -> Merged<T>,
{
    let mut ambiguous = false;
    let mut value = Vec::with_capacity(local.len().max(server.len()));

    for entry in local {
        match server.iter().find(|s| s.key() == entry.key()) {
            Some(other) => {
                let merged = merge(entry, other);
                ambiguous |= merged.ambiguous;
                value.push(merged.value);
            }
            None => value.push(entry.clone()),
        }
    }
    for entry in server {
        if !local.iter().any(|l| l.key() == entry.key()) {
            value.push(entry.clone());
        }
    }

    Merged { value, ambiguous }
}

fn pick<T: Clone + PartialEq>(local: &T, server: &T, newer: Newer) -> Merged<T> {
    let value = match newer {
        Newer::Local => local.clone(),
        Newer::Server => server.clone(),
    };
    Merged {
        value,
        ambiguous: local != server,
    }
}

fn vocabulary_entry(
    local: &VocabularyEntry,
    server: &VocabularyEntry,
    newer: Newer,
) -> Merged<VocabularyEntry> {
    // A translation only one side has is not a disagreement.
    let translation = match (&local.translation, &server.translation) {
        (Some(_), Some(_)) => pick(&local.translation, &server.translation, newer),
        (Some(t), None) | (None, Some(t)) => Merged::clean(Some(t.clone())),
        (None, None) => Merged::clean(None),
    };

    Merged {
        value: VocabularyEntry {
            word: local.word.clone(),
            translation: translation.value,
            correct_count: local.correct_count.max(server.correct_count),
            incorrect_count: local.incorrect_count.max(server.incorrect_count),
            mastery_level: local.mastery_level.max(server.mastery_level),
            last_reviewed: local.last_reviewed.max(server.last_reviewed),
            history: history(&local.history, &server.history),
        },
        ambiguous: translation.ambiguous,
    }
}

pub fn vocabulary(
    local: &VocabularyData,
    server: &VocabularyData,
    newer: Newer,
) -> Merged<VocabularyData> {
    let words = union_keyed(&local.words, &server.words, |l, s| {
        vocabulary_entry(l, s, newer)
    });
    Merged {
        value: VocabularyData { words: words.value },
        ambiguous: words.ambiguous,
    }
}

fn learning_record(
    local: &LearningRecord,
    server: &LearningRecord,
    newer: Newer,
) -> Merged<LearningRecord> {
    let kind = pick(&local.kind, &server.kind, newer);
    Merged {
        value: LearningRecord {
            id: local.id.clone(),
            kind: kind.value,
            score: local.score.max(server.score),
            progress: local.progress.max(server.progress),
            duration_secs: local.duration_secs.max(server.duration_secs),
            completed_at: earliest(local.completed_at, server.completed_at),
            history: history(&local.history, &server.history),
        },
        ambiguous: kind.ambiguous,
    }
}

pub fn learning_records(
    local: &LearningRecordsData,
    server: &LearningRecordsData,
    newer: Newer,
) -> Merged<LearningRecordsData> {
    let records = union_keyed(&local.records, &server.records, |l, s| {
        learning_record(l, s, newer)
    });
    Merged {
        value: LearningRecordsData {
            records: records.value,
        },
        ambiguous: records.ambiguous,
    }
}

fn achievement(local: &Achievement, server: &Achievement) -> Merged<Achievement> {
    // Targets are defined by the server catalogue.
    Merged {
        value: Achievement {
            id: local.id.clone(),
            unlocked_at: earliest(local.unlocked_at, server.unlocked_at),
            progress: local.progress.max(server.progress),
            target: server.target,
        },
        ambiguous: local.target != server.target,
    }
}

/// Union where an achievement unlocked anywhere stays unlocked at its
/// earliest unlock time.
pub fn achievements(local: &AchievementsData, server: &AchievementsData) -> Merged<AchievementsData> {
    let achievements = union_keyed(&local.achievements, &server.achievements, achievement);
    Merged {
        value: AchievementsData {
            achievements: achievements.value,
        },
        ambiguous: achievements.ambiguous,
    }
}

/// Earliest of two optional instants, ignoring missing ones.
fn earliest<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Highest-value merge for untyped JSON.
///
/// Two numbers merge to the larger one. Two objects merge field by field
/// when every field present on both sides is numeric. Anything else has
/// no value-based merge and returns `None`.
pub fn json_numeric(local: &Value, server: &Value) -> Option<Value> {
    match (local, server) {
        (Value::Number(_), Value::Number(_)) => Some(max_number(local, server)),
        (Value::Object(l), Value::Object(s)) => {
            let mut merged = Map::new();
            for (key, lv) in l {
                match s.get(key) {
                    Some(sv) if lv.is_number() && sv.is_number() => {
                        merged.insert(key.clone(), max_number(lv, sv));
                    }
                    Some(sv) if lv == sv => {
                        merged.insert(key.clone(), lv.clone());
                    }
                    Some(_) => return None,
                    None => {
                        merged.insert(key.clone(), lv.clone());
                    }
                }
            }
            for (key, sv) in s {
                if !l.contains_key(key) {
                    merged.insert(key.clone(), sv.clone());
                }
            }
            Some(Value::Object(merged))
        }
        _ => None,
    }
}

fn max_number(a: &Value, b: &Value) -> Value {
    let av = a.as_f64().unwrap_or(f64::MIN);
    let bv = b.as_f64().unwrap_or(f64::MIN);
    if bv > av {
        b.clone()
    } else {
        a.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn event(minute: i64, action: &str) -> HistoryEvent {
        HistoryEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            action: action.to_string(),
        }
    }

    #[test]
    fn test_history_union_dedups_and_sorts() {
        let local = vec![event(1, "review"), event(5, "review")];
        let server = vec![event(3, "review"), event(1, "review")];
        let merged = history(&local, &server);
        assert_eq!(merged, vec![event(1, "review"), event(3, "review"), event(5, "review")]);
    }

    #[test]
    fn test_vocabulary_entry_takes_max_counts() {
        let mut local = VocabularyEntry::new("hola");
        local.correct_count = 4;
        local.incorrect_count = 1;
        local.translation = Some("hello".into());
        let mut server = VocabularyEntry::new("hola");
        server.correct_count = 2;
        server.incorrect_count = 3;
        server.mastery_level = 2;

        let merged = vocabulary(
            &VocabularyData { words: vec![local] },
            &VocabularyData { words: vec![server] },
            Newer::Server,
        );
        let entry = &merged.value.words[0];
        assert_eq!(entry.correct_count, 4);
        assert_eq!(entry.incorrect_count, 3);
        assert_eq!(entry.mastery_level, 2);
        assert_eq!(entry.translation.as_deref(), Some("hello"));
        assert!(!merged.ambiguous);
    }

    #[test]
    fn test_conflicting_translation_is_ambiguous() {
        let mut local = VocabularyEntry::new("gato");
        local.translation = Some("cat".into());
        let mut server = VocabularyEntry::new("gato");
        server.translation = Some("kitty".into());

        let merged = vocabulary(
            &VocabularyData { words: vec![local] },
            &VocabularyData { words: vec![server] },
            Newer::Local,
        );
        assert!(merged.ambiguous);
        assert_eq!(merged.value.words[0].translation.as_deref(), Some("cat"));
    }

    #[test]
    fn test_achievement_keeps_earliest_unlock() {
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
        let local = AchievementsData {
            achievements: vec![Achievement {
                id: "streak_7".into(),
                unlocked_at: Some(late),
                progress: 7,
                target: 7,
            }],
        };
        let server = AchievementsData {
            achievements: vec![
                Achievement {
                    id: "streak_7".into(),
                    unlocked_at: Some(early),
                    progress: 7,
                    target: 7,
                },
                Achievement {
                    id: "first_word".into(),
                    unlocked_at: None,
                    progress: 0,
                    target: 1,
                },
            ],
        };

        let merged = achievements(&local, &server).value;
        assert_eq!(merged.achievements.len(), 2);
        assert_eq!(merged.achievements[0].unlocked_at, Some(early));
    }

    #[test]
    fn test_locked_side_does_not_relock() {
        let unlocked = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(earliest(None, Some(unlocked)), Some(unlocked));
        assert_eq!(earliest(Some(unlocked), None), Some(unlocked));
    }

    #[test]
    fn test_json_numeric() {
        assert_eq!(json_numeric(&json!(3), &json!(7.5)), Some(json!(7.5)));
        assert_eq!(
            json_numeric(&json!({"a": 1, "b": 9, "tag": "x"}), &json!({"a": 4, "c": 2, "tag": "x"})),
            Some(json!({"a": 4, "b": 9, "c": 2, "tag": "x"}))
        );
        assert_eq!(json_numeric(&json!({"tag": "x"}), &json!({"tag": "y"})), None);
        assert_eq!(json_numeric(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn test_progress_union() {
        let mut local = ProgressData::default();
        local.counters.insert("lessons".into(), 3);
        let mut server = ProgressData::default();
        server.counters.insert("lessons".into(), 5);
        server.counters.insert("quizzes".into(), 1);

        let merged = progress(&local, &server);
        assert_eq!(merged.counters["lessons"], 5);
        assert_eq!(merged.counters["quizzes"], 1);
    }
}
