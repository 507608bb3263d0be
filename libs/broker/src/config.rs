use std::path::PathBuf;
use std::time::Duration;

use herald_channel::DEFAULT_MAX_FRAME_LEN;

/// Upper bound for the default eviction cadence.
const MAX_DEFAULT_SWEEP: Duration = Duration::from_secs(1);

/// Everything a [`crate::Broker`] needs to start.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    /// 0 binds an ephemeral port; see [`crate::Broker::local_addr`].
    pub port: u16,
    /// How long a message stays in the in-memory cache after being appended.
    pub cache_duration: Duration,
    /// Cadence of the eviction sweep.
    pub sweep_interval: Duration,
    /// One subdirectory per topic lives here.
    pub storage_root: PathBuf,
    pub max_frame_len: usize,
}

impl BrokerConfig {
    /// Listen on all interfaces with the default sweep cadence and frame limit.
    pub fn new(port: u16, cache_duration: Duration, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            cache_duration,
            sweep_interval: default_sweep_interval(cache_duration),
            storage_root: storage_root.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

/// The cache duration, clamped to `(0, 1s]`.
pub fn default_sweep_interval(cache_duration: Duration) -> Duration {
    cache_duration.clamp(Duration::from_millis(1), MAX_DEFAULT_SWEEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_follows_short_cache_durations_and_caps_long_ones() {
        assert_eq!(default_sweep_interval(Duration::from_millis(100)), Duration::from_millis(100));
        assert_eq!(default_sweep_interval(Duration::from_secs(60)), Duration::from_secs(1));
        assert_eq!(default_sweep_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[test]
    fn new_listens_on_all_interfaces() {
        let config = BrokerConfig::new(8889, Duration::from_secs(5), "/tmp/herald");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
    }
}
