//! Adaptive sync strategy selection.
//!
//! Maps the device context (network, battery, user activity, time of day) to
//! how often and how much to sync. Evaluation is a pure function of its
//! inputs so it can be called from anywhere and tested exhaustively.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use lexisync_common::{Error, Result};

use crate::activity::{ActivityAssessment, ActivityLevel};
use crate::network::NetworkType;

/// Device and user context at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncContext {
    pub network: NetworkType,
    /// Battery charge, 0-100.
    pub battery_level: u8,
    #[serde(default)]
    pub is_charging: bool,
    pub activity: ActivityAssessment,
    /// Local hour, 0-23.
    pub hour_of_day: u8,
}

/// How the scheduler should behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStrategy {
    /// Time between scheduled sync cycles.
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub interval: Duration,
    /// Maximum changes per cycle.
    pub batch_size: usize,
    /// Deliver every recorded change immediately.
    pub real_time: bool,
}

impl Default for SyncStrategy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            batch_size: 50,
            real_time: false,
        }
    }
}

/// Tunables for [`StrategySelector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub min_interval: Duration,
    #[serde(with = "lexisync_common::types::duration_ms")]
    pub max_interval: Duration,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    /// Below this charge (and not charging) syncing is throttled hard.
    pub critical_battery: u8,
    pub low_battery: u8,
    /// Night hours `[start, end)` in which idle sync slows down.
    pub quiet_hours: (u8, u8),
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(3600),
            max_batch_size: 100,
            min_batch_size: 5,
            critical_battery: 15,
            low_battery: 30,
            quiet_hours: (0, 6),
        }
    }
}

impl StrategyConfig {
    /// Reject bounds that cannot hold together.
    pub fn validate(&self) -> Result<()> {
        if self.min_interval > self.max_interval {
            return Err(Error::InvalidInput(format!(
                "strategy min_interval {:?} exceeds max_interval {:?}",
                self.min_interval, self.max_interval
            )));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(Error::InvalidInput(format!(
                "strategy min_batch_size {} exceeds max_batch_size {}",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.min_batch_size == 0 {
            return Err(Error::InvalidInput(
                "strategy min_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pure mapping from [`SyncContext`] to [`SyncStrategy`].
#[derive(Debug, Clone, Default)]
pub struct StrategySelector {
    config: StrategyConfig,
}

impl StrategySelector {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Choose a strategy for `context`.
    pub fn evaluate(&self, context: &SyncContext) -> SyncStrategy {
        let cfg = &self.config;
        let level = context.activity.level;

        let (mut interval_secs, mut batch_size): (u64, usize) = match level {
            ActivityLevel::High => (30, 50),
            ActivityLevel::Medium => (120, 25),
            ActivityLevel::Low => (600, 10),
            ActivityLevel::Inactive => (1800, 5),
        };

        match context.network {
            NetworkType::Wifi => batch_size *= 2,
            NetworkType::Cellular => interval_secs *= 2,
            NetworkType::Offline => {
                return SyncStrategy {
                    interval: cfg.max_interval,
                    batch_size: cfg.min_batch_size,
                    real_time: false,
                };
            }
        }

        let powered = context.is_charging || context.battery_level >= 50;
        if !context.is_charging && context.battery_level < cfg.critical_battery {
            interval_secs *= 4;
            batch_size = batch_size.min(cfg.min_batch_size);
        } else if !context.is_charging && context.battery_level < cfg.low_battery {
            interval_secs *= 2;
        }

        let (quiet_start, quiet_end) = cfg.quiet_hours;
        let quiet = context.hour_of_day >= quiet_start && context.hour_of_day < quiet_end;
        if quiet && level != ActivityLevel::High {
            interval_secs *= 2;
        }

        // Upper bound wins if the config is inverted.
        let interval = Duration::from_secs(interval_secs)
            .max(cfg.min_interval)
            .min(cfg.max_interval);
        SyncStrategy {
            interval,
            batch_size: batch_size.max(cfg.min_batch_size).min(cfg.max_batch_size),
            real_time: level == ActivityLevel::High
                && context.network == NetworkType::Wifi
                && powered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn context(network: NetworkType, battery: u8, level: ActivityLevel, hour: u8) -> SyncContext {
        SyncContext {
            network,
            battery_level: battery,
            is_charging: false,
            activity: ActivityAssessment::fixed(level),
            hour_of_day: hour,
        }
    }

    #[test]
    fn test_active_on_wifi_is_real_time() {
        let strategy = StrategySelector::default()
            .evaluate(&context(NetworkType::Wifi, 90, ActivityLevel::High, 14));
        assert!(strategy.real_time);
        assert_eq!(strategy.interval, Duration::from_secs(30));
        assert_eq!(strategy.batch_size, 100);
    }

    #[test]
    fn test_low_battery_cellular_is_conservative() {
        let selector = StrategySelector::default();
        let strategy = selector.evaluate(&context(NetworkType::Cellular, 10, ActivityLevel::Medium, 14));
        assert!(!strategy.real_time);
        assert_eq!(strategy.interval, Duration::from_secs(960));
        assert_eq!(strategy.batch_size, 5);

        let charging = selector.evaluate(&SyncContext {
            is_charging: true,
            ..context(NetworkType::Cellular, 10, ActivityLevel::Medium, 14)
        });
        assert_eq!(charging.interval, Duration::from_secs(240));
    }

    #[test]
    fn test_offline_backs_off_fully() {
        let strategy = StrategySelector::default()
            .evaluate(&context(NetworkType::Offline, 100, ActivityLevel::High, 12));
        assert_eq!(strategy.interval, Duration::from_secs(3600));
        assert!(!strategy.real_time);
    }

    #[test]
    fn test_quiet_hours_slow_idle_sync() {
        let selector = StrategySelector::default();
        let night = selector.evaluate(&context(NetworkType::Wifi, 80, ActivityLevel::Low, 3));
        let day = selector.evaluate(&context(NetworkType::Wifi, 80, ActivityLevel::Low, 15));
        assert_eq!(night.interval, day.interval * 2);
    }

    #[test]
    fn test_inverted_bounds_are_rejected_without_panicking() {
        let config = StrategyConfig {
            min_interval: Duration::from_secs(600),
            max_interval: Duration::from_secs(60),
            min_batch_size: 80,
            max_batch_size: 10,
            ..StrategyConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(StrategyConfig::default().validate().is_ok());

        let strategy = StrategySelector::new(config)
            .evaluate(&context(NetworkType::Wifi, 90, ActivityLevel::High, 14));
        assert_eq!(strategy.interval, Duration::from_secs(60));
        assert_eq!(strategy.batch_size, 10);
    }

    fn any_network() -> impl Strategy<Value = NetworkType> {
        prop_oneof![
            Just(NetworkType::Wifi),
            Just(NetworkType::Cellular),
            Just(NetworkType::Offline)
        ]
    }

    fn any_level() -> impl Strategy<Value = ActivityLevel> {
        prop_oneof![
            Just(ActivityLevel::High),
            Just(ActivityLevel::Medium),
            Just(ActivityLevel::Low),
            Just(ActivityLevel::Inactive)
        ]
    }

    proptest! {
        #[test]
        fn strategy_stays_in_bounds(
            network in any_network(),
            battery in 0u8..=100,
            level in any_level(),
            hour in 0u8..24,
        ) {
            let selector = StrategySelector::default();
            let strategy = selector.evaluate(&context(network, battery, level, hour));
            let cfg = selector.config();
            prop_assert!(strategy.interval >= cfg.min_interval);
            prop_assert!(strategy.interval <= cfg.max_interval);
            prop_assert!(strategy.batch_size >= cfg.min_batch_size);
            prop_assert!(strategy.batch_size <= cfg.max_batch_size);
            if network == NetworkType::Offline {
                prop_assert!(!strategy.real_time);
            }
        }
    }
}
