use std::time::Duration;

/// Engine-level configuration for an office floor.
///
/// Controls the monitor clock, asynchronous operation timeouts, and how long
/// `close()` waits for in-flight work.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between monitor clock ticks in milliseconds. Also the
    /// granularity at which asynchronous operation timeouts are detected.
    pub monitor_interval_ms: u64,
    /// Timeout applied to asynchronous operations of sources that do not
    /// declare their own. `None` disables the default timeout.
    pub default_asynchronous_timeout_ms: Option<u64>,
    /// How long `close()` waits for processes to drain and for team workers
    /// to stop, in milliseconds.
    pub close_timeout_ms: u64,
    /// Prefix for the names of worker threads created by teams.
    pub thread_name_prefix: String,
}

impl EngineConfig {
    /// Returns the monitor tick interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    /// Returns the close drain timeout.
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 100,
            default_asynchronous_timeout_ms: None,
            close_timeout_ms: 10_000,
            thread_name_prefix: "officefloor".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.monitor_interval(), Duration::from_millis(100));
        assert_eq!(config.close_timeout(), Duration::from_secs(10));
        assert!(config.default_asynchronous_timeout_ms.is_none());
    }

    #[test]
    fn zero_monitor_interval_is_clamped() {
        let config = EngineConfig {
            monitor_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.monitor_interval(), Duration::from_millis(1));
    }
}
