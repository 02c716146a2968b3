//! Configuration types.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker concurrency per lane.
    pub lane_concurrency: usize,
    /// Watchdog reconcile interval.
    pub watchdog_interval: Duration,
    /// Grace window before an active task with no queue job counts as
    /// orphaned. Protects against races right after enqueue or restart.
    pub orphan_grace: Duration,
    /// Processing rows with no heartbeat for this long are swept as timed out.
    pub heartbeat_timeout: Duration,
    /// Maximum rows the watchdog touches per cycle.
    pub watchdog_batch_limit: usize,
    /// Maximum target pairs per resolver store query.
    pub resolver_batch_size: usize,
    /// Replay subscriber poll interval for task terminal state.
    pub replay_poll_interval: Duration,
    /// Replay subscriber overall timeout.
    pub replay_timeout: Duration,
    /// Fallback poller interval.
    pub poll_interval: Duration,
    /// Fallback poller overall timeout.
    pub poll_timeout: Duration,
    /// Broadcast channel capacity for the event feed.
    pub event_channel_capacity: usize,
    /// Maximum events returned by a replay listing.
    pub replay_events_limit: usize,
}

impl EngineConfig {
    /// Build a config from `GENLANE_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lane_concurrency: env_usize("GENLANE_LANE_CONCURRENCY", defaults.lane_concurrency),
            watchdog_interval: env_secs("GENLANE_WATCHDOG_INTERVAL_SECS", defaults.watchdog_interval),
            orphan_grace: env_secs("GENLANE_ORPHAN_GRACE_SECS", defaults.orphan_grace),
            heartbeat_timeout: env_secs("GENLANE_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            watchdog_batch_limit: env_usize("GENLANE_WATCHDOG_BATCH_LIMIT", defaults.watchdog_batch_limit),
            resolver_batch_size: env_usize("GENLANE_RESOLVER_BATCH_SIZE", defaults.resolver_batch_size),
            ..defaults
        }
    }
}

fn env_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(fallback)
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lane_concurrency: 4,
            watchdog_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_secs(120),
            heartbeat_timeout: Duration::from_secs(600), // 10 minutes
            watchdog_batch_limit: 200,
            resolver_batch_size: 50,
            replay_poll_interval: Duration::from_millis(1500),
            replay_timeout: Duration::from_secs(1800), // 30 minutes
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(600),
            event_channel_capacity: 1024,
            replay_events_limit: 5000,
        }
    }
}
