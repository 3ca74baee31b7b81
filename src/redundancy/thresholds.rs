use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::settings::{
    SettingsStore, FAILBACK_STABILIZATION_PERIOD_KEY, FAILOVER_COOLDOWN_KEY,
    FAILOVER_SILENCE_THRESHOLD_KEY,
};

pub const DEFAULT_FAILOVER_SILENCE_THRESHOLD: Duration = Duration::from_secs(2);
pub const DEFAULT_FAILOVER_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILBACK_STABILIZATION_PERIOD: Duration = Duration::from_secs(10);

/// Timing thresholds for automatic failover
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailoverThresholds {
    /// Continuous silence (or clipping) on the active source before switching
    pub silence_threshold: Duration,
    /// Minimum time between two automatic switches
    pub cooldown: Duration,
    /// How long a demoted source must stay usable before switching back to it
    pub stabilization_period: Duration,
}

impl Default for FailoverThresholds {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_FAILOVER_SILENCE_THRESHOLD,
            cooldown: DEFAULT_FAILOVER_COOLDOWN,
            stabilization_period: DEFAULT_FAILBACK_STABILIZATION_PERIOD,
        }
    }
}

impl FailoverThresholds {
    /// Read overrides from the settings store, keeping defaults for unset keys
    pub fn from_settings(store: &SettingsStore) -> Self {
        let thresholds = Self {
            silence_threshold: read_seconds(
                store,
                FAILOVER_SILENCE_THRESHOLD_KEY,
                DEFAULT_FAILOVER_SILENCE_THRESHOLD,
            ),
            cooldown: read_seconds(store, FAILOVER_COOLDOWN_KEY, DEFAULT_FAILOVER_COOLDOWN),
            stabilization_period: read_seconds(
                store,
                FAILBACK_STABILIZATION_PERIOD_KEY,
                DEFAULT_FAILBACK_STABILIZATION_PERIOD,
            ),
        };

        if thresholds != Self::default() {
            info!(
                "Failover thresholds: silence={:?}, cooldown={:?}, stabilization={:?}",
                thresholds.silence_threshold, thresholds.cooldown, thresholds.stabilization_period
            );
        }
        thresholds
    }
}

fn read_seconds(store: &SettingsStore, key: &str, default: Duration) -> Duration {
    let Some(secs) = store.get_f64(key) else {
        return default;
    };
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => duration,
        Err(e) => {
            warn!("Ignoring invalid {} = {} ({}), using {:?}", key, secs, e, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let thresholds = FailoverThresholds::from_settings(&SettingsStore::in_memory());
        assert_eq!(thresholds.silence_threshold, Duration::from_secs_f64(2.0));
        assert_eq!(thresholds.cooldown, Duration::from_secs_f64(5.0));
        assert_eq!(thresholds.stabilization_period, Duration::from_secs_f64(10.0));
    }

    #[test]
    fn test_overrides_are_applied() {
        let mut store = SettingsStore::in_memory();
        store.set(FAILOVER_SILENCE_THRESHOLD_KEY, 3.5).unwrap();
        store.set(FAILOVER_COOLDOWN_KEY, 1.0).unwrap();
        store.set(FAILBACK_STABILIZATION_PERIOD_KEY, 20).unwrap();

        let thresholds = FailoverThresholds::from_settings(&store);
        assert_eq!(thresholds.silence_threshold, Duration::from_secs_f64(3.5));
        assert_eq!(thresholds.cooldown, Duration::from_secs(1));
        assert_eq!(thresholds.stabilization_period, Duration::from_secs(20));
    }

    #[test]
    fn test_negative_override_falls_back() {
        let mut store = SettingsStore::in_memory();
        store.set(FAILOVER_COOLDOWN_KEY, -4.0).unwrap();

        let thresholds = FailoverThresholds::from_settings(&store);
        assert_eq!(thresholds.cooldown, DEFAULT_FAILOVER_COOLDOWN);
    }

    #[test]
    fn test_out_of_range_override_falls_back() {
        let mut store = SettingsStore::in_memory();
        store.set(FAILOVER_COOLDOWN_KEY, 1e300).unwrap();
        store.set(FAILOVER_SILENCE_THRESHOLD_KEY, f64::MAX).unwrap();
        store.set(FAILBACK_STABILIZATION_PERIOD_KEY, 30).unwrap();

        let thresholds = FailoverThresholds::from_settings(&store);
        assert_eq!(thresholds.cooldown, DEFAULT_FAILOVER_COOLDOWN);
        assert_eq!(thresholds.silence_threshold, DEFAULT_FAILOVER_SILENCE_THRESHOLD);
        assert_eq!(thresholds.stabilization_period, Duration::from_secs(30));

        let manager = crate::redundancy::RedundantCaptureManager::from_settings(&store);
        assert_eq!(manager.effective_failover_cooldown(), DEFAULT_FAILOVER_COOLDOWN);
    }
}
