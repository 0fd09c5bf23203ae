//! Coordination tuning knobs

use std::time::Duration;

/// Thread coordination configuration
#[derive(Debug, Clone)]
pub struct ThreadsConfig {
    /// How long a requester waits on a suspend barrier (default: 10s)
    pub suspend_timeout: Duration,
    /// Suspend-all pauses longer than this are logged (default: 5ms)
    pub long_suspend_threshold: Duration,
    /// Retry limit for single-thread suspension (default: 500 debug, 5000 release)
    pub max_suspend_retries: u32,
    /// Sleep between suspension retries (default: 100us)
    pub suspend_retry_sleep: Duration,
    /// Re-broadcast interval while waiting on an empty checkpoint (default: 100ms)
    pub empty_checkpoint_poll: Duration,
    /// Give up on an empty checkpoint after this long (default: 10min)
    pub empty_checkpoint_timeout: Duration,
    /// Largest thread id handed out (default: 65535)
    pub max_threads: u32,
    /// Extra contract checks on the slow paths (default: on in debug builds)
    pub debug_locking: bool,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            suspend_timeout: Duration::from_secs(10),
            long_suspend_threshold: Duration::from_millis(5),
            max_suspend_retries: if cfg!(debug_assertions) { 500 } else { 5000 },
            suspend_retry_sleep: Duration::from_micros(100),
            empty_checkpoint_poll: Duration::from_millis(100),
            empty_checkpoint_timeout: Duration::from_secs(600),
            max_threads: u16::MAX as u32,
            debug_locking: cfg!(debug_assertions),
        }
    }
}

impl ThreadsConfig {
    /// Defaults with `OTTER_*` environment overrides applied.
    ///
    /// - `OTTER_THREAD_SUSPEND_TIMEOUT_MS`
    /// - `OTTER_LONG_SUSPEND_MS`
    /// - `OTTER_EMPTY_CHECKPOINT_TIMEOUT_MS`
    /// - `OTTER_DEBUG_LOCKING`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_env_u64("OTTER_THREAD_SUSPEND_TIMEOUT_MS") {
            config.suspend_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("OTTER_LONG_SUSPEND_MS") {
            config.long_suspend_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("OTTER_EMPTY_CHECKPOINT_TIMEOUT_MS") {
            config.empty_checkpoint_timeout = Duration::from_millis(ms);
        }
        if let Ok(value) = std::env::var("OTTER_DEBUG_LOCKING") {
            config.debug_locking = parse_env_truthy(&value);
        }
        config
    }
}

fn parse_env_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0")
        && !value.trim().eq_ignore_ascii_case("false")
        && !value.trim().eq_ignore_ascii_case("off")
        && !value.trim().eq_ignore_ascii_case("no")
}

fn parse_env_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ThreadsConfig::default();
        assert_eq!(config.suspend_timeout, Duration::from_secs(10));
        assert_eq!(config.long_suspend_threshold, Duration::from_millis(5));
        assert_eq!(config.max_threads, 65535);
        assert_eq!(config.debug_locking, cfg!(debug_assertions));
    }

    #[test]
    fn test_parse_env_truthy() {
        assert!(parse_env_truthy("1"));
        assert!(parse_env_truthy("yes"));
        assert!(parse_env_truthy(" TRUE "));
        assert!(!parse_env_truthy(""));
        assert!(!parse_env_truthy("0"));
        assert!(!parse_env_truthy("Off"));
        assert!(!parse_env_truthy("no"));
        assert!(!parse_env_truthy("false"));
    }

    #[test]
    fn test_parse_env_u64_missing() {
        assert_eq!(parse_env_u64("OTTER_THREADS_TEST_SURELY_UNSET_VAR"), None);
    }
}
