//! Common types shared across lexisync crates.
//!
//! This module provides the error type, the domain vocabulary and the typed
//! payloads that every other crate speaks.

pub mod error;
pub mod payload;
pub mod types;

pub use error::{Error, Result};
pub use payload::{
    Achievement, AchievementsData, DomainPayload, ExperienceData, HistoryEvent, Keyed,
    LearningRecord, LearningRecordsData, ProgressData, UserStatsData, VocabularyData,
    VocabularyEntry,
};
pub use types::{ChangeOperation, Domain};
