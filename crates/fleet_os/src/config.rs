#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use fleet_engines::aggregator::AggregatorConfig;
use fleet_engines::reconciler::ReconcilerConfig;

use crate::sync_manager::RetryPolicy;

pub const EVENT_POLL_INTERVAL_MS_DEFAULT: u64 = 10_000;
pub const REGISTRY_POLL_INTERVAL_MS_DEFAULT: u64 = 30_000;
pub const SYNC_INTERVAL_MS_DEFAULT: u64 = 15_000;
pub const GEOLOCATION_TIMEOUT_MS_DEFAULT: u64 = 5_000;
pub const OFFLINE_QUEUE_DIR_DEFAULT: &str = "var/fleet";

/// Runtime knobs for the sync engine. `mvp_v1` holds the defaults; `from_env` overrides
/// them from `FLEET_*` variables, ignoring values outside their accepted range.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSyncConfig {
    pub staleness_window_ms: u64,
    pub reconciler_window: usize,
    pub event_poll_interval_ms: u64,
    pub registry_poll_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub geolocation_timeout_ms: u64,
    pub offline_queue_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for FleetSyncConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl FleetSyncConfig {
    pub fn mvp_v1() -> Self {
        Self {
            staleness_window_ms: fleet_engines::aggregator::STALENESS_WINDOW_MS_DEFAULT,
            reconciler_window: fleet_engines::reconciler::RECONCILER_WINDOW_DEFAULT,
            event_poll_interval_ms: EVENT_POLL_INTERVAL_MS_DEFAULT,
            registry_poll_interval_ms: REGISTRY_POLL_INTERVAL_MS_DEFAULT,
            sync_interval_ms: SYNC_INTERVAL_MS_DEFAULT,
            geolocation_timeout_ms: GEOLOCATION_TIMEOUT_MS_DEFAULT,
            offline_queue_dir: PathBuf::from(OFFLINE_QUEUE_DIR_DEFAULT),
            retry: RetryPolicy::mvp_v1(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::mvp_v1();
        let u64_in = |key: &str, lo: u64, hi: u64, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| (lo..=hi).contains(v))
                .unwrap_or(default)
        };
        let retry = RetryPolicy {
            max_attempts: lookup("FLEET_SYNC_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse::<u16>().ok())
                .filter(|v| (1..=100).contains(v))
                .unwrap_or(d.retry.max_attempts),
            base_delay_ms: u64_in("FLEET_SYNC_BASE_DELAY_MS", 100, 60_000, d.retry.base_delay_ms),
            max_delay_ms: u64_in("FLEET_SYNC_MAX_DELAY_MS", 1_000, 3_600_000, d.retry.max_delay_ms),
            multiplier: lookup("FLEET_SYNC_BACKOFF_MULTIPLIER")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && (1.0..=10.0).contains(v))
                .unwrap_or(d.retry.multiplier),
        };
        let offline_queue_dir = lookup("FLEET_OFFLINE_QUEUE_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(d.offline_queue_dir);

        Self {
            staleness_window_ms: u64_in(
                "FLEET_STALENESS_WINDOW_MS",
                10_000,
                3_600_000,
                d.staleness_window_ms,
            ),
            reconciler_window: u64_in("FLEET_RECONCILER_WINDOW", 1, 1_000, d.reconciler_window as u64)
                as usize,
            event_poll_interval_ms: u64_in(
                "FLEET_EVENT_POLL_INTERVAL_MS",
                1_000,
                600_000,
                d.event_poll_interval_ms,
            ),
            registry_poll_interval_ms: u64_in(
                "FLEET_REGISTRY_POLL_INTERVAL_MS",
                1_000,
                3_600_000,
                d.registry_poll_interval_ms,
            ),
            sync_interval_ms: u64_in("FLEET_SYNC_INTERVAL_MS", 1_000, 3_600_000, d.sync_interval_ms),
            geolocation_timeout_ms: u64_in(
                "FLEET_GEOLOCATION_TIMEOUT_MS",
                100,
                60_000,
                d.geolocation_timeout_ms,
            ),
            offline_queue_dir,
            retry,
        }
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            staleness_window_ms: self.staleness_window_ms,
            ..AggregatorConfig::mvp_v1()
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            window_size: self.reconciler_window,
        }
    }

    pub fn geolocation_timeout(&self) -> Duration {
        Duration::from_millis(self.geolocation_timeout_ms)
    }
}
