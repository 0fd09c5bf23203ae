//! Pause and checkpoint counters

use std::time::Duration;

/// Statistics for suspension and checkpoints
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SuspendStats {
    /// Completed suspend-all pauses
    pub suspend_alls: u64,
    /// Total time spent suspending all threads (nanoseconds)
    pub total_suspend_all_ns: u64,
    /// Longest suspend-all (nanoseconds)
    pub max_suspend_all_ns: u64,
    /// Suspend-all pauses above the long-suspend threshold
    pub long_suspends: u64,
    /// Single-thread suspensions
    pub thread_suspends: u64,
    /// `run_checkpoint` calls
    pub checkpoints: u64,
    /// `run_empty_checkpoint` calls
    pub empty_checkpoints: u64,
}

impl SuspendStats {
    pub(crate) fn record_suspend_all(&mut self, elapsed: Duration, long: bool) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.suspend_alls += 1;
        self.total_suspend_all_ns = self.total_suspend_all_ns.saturating_add(ns);
        self.max_suspend_all_ns = self.max_suspend_all_ns.max(ns);
        if long {
            self.long_suspends += 1;
        }
    }

    /// Mean suspend-all time
    pub fn mean_suspend_all(&self) -> Duration {
        if self.suspend_alls == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_suspend_all_ns / self.suspend_alls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_suspend_all() {
        let mut stats = SuspendStats::default();
        assert_eq!(stats.mean_suspend_all(), Duration::ZERO);
        stats.record_suspend_all(Duration::from_micros(10), false);
        stats.record_suspend_all(Duration::from_micros(30), true);
        assert_eq!(stats.suspend_alls, 2);
        assert_eq!(stats.long_suspends, 1);
        assert_eq!(stats.max_suspend_all_ns, 30_000);
        assert_eq!(stats.mean_suspend_all(), Duration::from_micros(20));
    }
}
