//! User activity tracking over a sliding window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Coarse activity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    Inactive,
    Low,
    Medium,
    High,
}

impl ActivityLevel {
    /// Bucket for a score in `[0, 1]`.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            ActivityLevel::High
        } else if score >= 0.4 {
            ActivityLevel::Medium
        } else if score > 0.1 {
            ActivityLevel::Low
        } else {
            ActivityLevel::Inactive
        }
    }
}

/// Activity estimate fed to the strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityAssessment {
    pub level: ActivityLevel,
    /// Interaction rate in `[0, 1]`.
    pub score: f64,
    /// How much data the estimate is based on, in `[0, 1]`.
    pub confidence: f64,
}

impl ActivityAssessment {
    pub fn inactive() -> Self {
        Self {
            level: ActivityLevel::Inactive,
            score: 0.0,
            confidence: 0.0,
        }
    }

    /// Assessment for a fixed level, as supplied by hosts that track
    /// activity themselves.
    pub fn fixed(level: ActivityLevel) -> Self {
        let score = match level {
            ActivityLevel::High => 0.85,
            ActivityLevel::Medium => 0.55,
            ActivityLevel::Low => 0.25,
            ActivityLevel::Inactive => 0.0,
        };
        Self {
            level,
            score,
            confidence: 1.0,
        }
    }
}

/// Counts user interactions in a sliding window.
#[derive(Debug)]
pub struct ActivityMonitor {
    window: Duration,
    /// Interactions per window that count as fully active.
    saturation: usize,
    events: Mutex<VecDeque<DateTime<Utc>>>,
}

impl ActivityMonitor {
    pub fn new(window: Duration, saturation: usize) -> Self {
        Self {
            window,
            saturation: saturation.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Note one interaction (answer submitted, word reviewed, ...).
    pub fn record_interaction(&self, at: DateTime<Utc>) {
        if let Ok(mut events) = self.events.lock() {
            let index = events.partition_point(|e| *e <= at);
            events.insert(index, at);
            prune(&mut events, at - self.window);
        }
    }

    pub fn assess(&self) -> ActivityAssessment {
        self.assess_at(Utc::now())
    }

    /// Activity as of `now`.
    pub fn assess_at(&self, now: DateTime<Utc>) -> ActivityAssessment {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(_) => return ActivityAssessment::inactive(),
        };
        prune(&mut events, now - self.window);

        let count = events.iter().filter(|at| **at <= now).count();
        if count == 0 {
            return ActivityAssessment::inactive();
        }

        let score = (count as f64 / self.saturation as f64).min(1.0);
        let confidence = (count as f64 / 10.0).min(1.0);
        ActivityAssessment {
            level: ActivityLevel::from_score(score),
            score,
            confidence,
        }
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(Duration::minutes(15), 30)
    }
}

fn prune(events: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while events.front().map_or(false, |at| *at < cutoff) {
        events.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(ActivityLevel::from_score(0.9), ActivityLevel::High);
        assert_eq!(ActivityLevel::from_score(0.7), ActivityLevel::High);
        assert_eq!(ActivityLevel::from_score(0.5), ActivityLevel::Medium);
        assert_eq!(ActivityLevel::from_score(0.2), ActivityLevel::Low);
        assert_eq!(ActivityLevel::from_score(0.1), ActivityLevel::Inactive);
    }

    #[test]
    fn test_window_slides() {
        let monitor = ActivityMonitor::new(Duration::minutes(10), 10);
        let start = Utc::now();
        for i in 0..8 {
            monitor.record_interaction(start + Duration::seconds(i * 30));
        }

        let busy = monitor.assess_at(start + Duration::minutes(5));
        assert_eq!(busy.level, ActivityLevel::High);
        assert!((busy.confidence - 0.8).abs() < 1e-9);

        let later = monitor.assess_at(start + Duration::minutes(30));
        assert_eq!(later.level, ActivityLevel::Inactive);
        assert_eq!(later.score, 0.0);
    }

    #[test]
    fn test_sparse_activity_is_low() {
        let monitor = ActivityMonitor::new(Duration::minutes(15), 30);
        let now = Utc::now();
        for i in 0..5 {
            monitor.record_interaction(now - Duration::minutes(i));
        }
        assert_eq!(monitor.assess_at(now).level, ActivityLevel::Low);
    }
}
