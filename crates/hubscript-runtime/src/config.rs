//! Configuration types for the hubscript runtime.
//!
//! Every field has a default so a config file only needs to name the values
//! it changes.

use serde::Deserialize;
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the bridge's job channel (backpressure threshold).
    /// Default: 64
    pub job_queue_capacity: usize,

    /// Default timeout for submitted executions.
    /// Default: 30000
    pub execution_timeout_ms: u64,

    /// Deadline for the main script. Unset means the main script may run
    /// as long as it needs.
    /// Default: none
    pub main_timeout_ms: Option<u64>,

    /// Termination tracking settings
    pub tracker: TrackerConfig,

    /// Network operation settings
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            job_queue_capacity: 64,
            execution_timeout_ms: 30_000,
            main_timeout_ms: None,
            tracker: TrackerConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// `Duration::MAX` when no main deadline is configured.
    pub fn main_timeout(&self) -> Duration {
        self.main_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::MAX)
    }
}

/// Settings for the execution tracker's termination watchdog.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive unchanged polls required before an idle tally terminates.
    pub stability_threshold: u32,

    /// Interval between termination polls.
    pub poll_interval_ms: u64,

    /// How long `wait_for_termination` waits before forcing shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stability_threshold: 3,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Settings for guest network operations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long a read waits for data. 0 = non-blocking: report "no data"
    /// immediately when nothing is buffered.
    pub read_timeout_ms: u64,

    /// Upper bound for a single read.
    pub max_read_bytes: usize,

    /// Timeout for `http_request`.
    pub http_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            max_read_bytes: 64 * 1024,
            http_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.job_queue_capacity, 64);
        assert_eq!(config.tracker.stability_threshold, 3);
        assert_eq!(config.network.read_timeout(), Duration::ZERO);
        assert_eq!(config.main_timeout(), Duration::MAX);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "tracker": { "poll_interval_ms": 20 } }"#).unwrap();
        assert_eq!(config.tracker.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.tracker.stability_threshold, 3);
        assert_eq!(config.execution_timeout(), Duration::from_secs(30));
    }
}
