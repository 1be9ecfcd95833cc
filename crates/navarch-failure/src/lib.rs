//! Per-key exponential backoff bookkeeping shared by every provider and
//! zone selection path.
//!
//! A key is opaque to this crate — callers use either a bare provider
//! name or `"{provider}:{zone}"`, whichever granularity they need
//! excluded.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FailureTrackerConfig {
    pub base_backoff: StdDuration,
    pub max_backoff: StdDuration,
    pub backoff_factor: f64,
    pub reset_after: StdDuration,
}

impl Default for FailureTrackerConfig {
    fn default() -> Self {
        Self {
            base_backoff: StdDuration::from_secs(30),
            max_backoff: StdDuration::from_secs(10 * 60),
            backoff_factor: 2.0,
            reset_after: StdDuration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    count: u32,
    last_failure: DateTime<Utc>,
    exclude_until: DateTime<Utc>,
}

/// A snapshot of one key's bookkeeping, returned by `get_stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureStats {
    pub key: String,
    pub count: u32,
    pub last_failure: DateTime<Utc>,
    pub remaining_exclusion: ChronoDuration,
}

pub struct FailureTracker {
    config: FailureTrackerConfig,
    records: RwLock<HashMap<String, FailureRecord>>,
}

impl FailureTracker {
    pub fn new(config: FailureTrackerConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Increments the failure count, stamps `last_failure`, and sets
    /// `exclude_until = now + base * factor^(count-1)` capped at
    /// `max_backoff`. Returns the backoff applied.
    pub fn record_failure(&self, key: &str, now: DateTime<Utc>) -> ChronoDuration {
        let mut records = self.records.write();
        let record = records.entry(key.to_string()).or_insert(FailureRecord {
            count: 0,
            last_failure: now,
            exclude_until: now,
        });
        record.count += 1;
        record.last_failure = now;

        let base_secs = self.config.base_backoff.as_secs_f64();
        let max_secs = self.config.max_backoff.as_secs_f64();
        let backoff_secs =
            (base_secs * self.config.backoff_factor.powi(record.count as i32 - 1)).min(max_secs);
        let backoff = ChronoDuration::milliseconds((backoff_secs * 1000.0) as i64);
        record.exclude_until = now + backoff;

        debug!(key, count = record.count, backoff_secs, "recorded failure");
        backoff
    }

    /// Deletes the record only if enough time has passed since the last
    /// failure; a success immediately following a failure does not clear
    /// backoff state (spec: "early success does not reset").
    pub fn record_success(&self, key: &str, now: DateTime<Utc>) {
        let mut records = self.records.write();
        let reset_after = ChronoDuration::from_std(self.config.reset_after)
            .expect("reset_after duration fits in chrono::Duration");
        if let Some(record) = records.get(key) {
            if now - record.last_failure >= reset_after {
                records.remove(key);
            }
        }
    }

    pub fn is_excluded(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.records
            .read()
            .get(key)
            .is_some_and(|r| now < r.exclude_until)
    }

    pub fn get_stats(&self, now: DateTime<Utc>) -> Vec<FailureStats> {
        self.records
            .read()
            .iter()
            .map(|(key, record)| FailureStats {
                key: key.clone(),
                count: record.count,
                last_failure: record.last_failure,
                remaining_exclusion: (record.exclude_until - now).max(ChronoDuration::zero()),
            })
            .collect()
    }

    pub fn reset(&self) {
        self.records.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FailureTracker {
        FailureTracker::new(FailureTrackerConfig::default())
    }

    #[test]
    fn first_failure_applies_base_backoff() {
        let tracker = tracker();
        let now = Utc::now();
        let backoff = tracker.record_failure("hetzner", now);
        assert_eq!(backoff, ChronoDuration::seconds(30));
    }

    #[test]
    fn repeated_failures_double_backoff_up_to_max() {
        let tracker = tracker();
        let mut now = Utc::now();
        let mut last = ChronoDuration::zero();
        for _ in 0..20 {
            last = tracker.record_failure("hetzner", now);
            now += ChronoDuration::seconds(1);
        }
        assert_eq!(last, ChronoDuration::seconds(600));
    }

    #[test]
    fn is_excluded_true_until_exclude_until_passes() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        assert!(tracker.is_excluded("hetzner", now));
        assert!(tracker.is_excluded("hetzner", now + ChronoDuration::seconds(29)));
        assert!(!tracker.is_excluded("hetzner", now + ChronoDuration::seconds(31)));
    }

    #[test]
    fn record_success_is_noop_when_recent_failure() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        tracker.record_success("hetzner", now + ChronoDuration::seconds(1));
        assert!(tracker.is_excluded("hetzner", now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn record_success_clears_record_after_reset_after() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        let later = now + ChronoDuration::minutes(6);
        tracker.record_success("hetzner", later);
        assert!(!tracker.is_excluded("hetzner", later));
        assert!(tracker.get_stats(later).is_empty());
    }

    #[test]
    fn get_stats_reports_remaining_exclusion() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        let stats = tracker.get_stats(now + ChronoDuration::seconds(10));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key, "hetzner");
        assert_eq!(stats[0].count, 1);
        assert_eq!(stats[0].remaining_exclusion, ChronoDuration::seconds(20));
    }

    #[test]
    fn reset_clears_all_keys() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        tracker.record_failure("vultr", now);
        tracker.reset();
        assert!(tracker.get_stats(now).is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let tracker = tracker();
        let now = Utc::now();
        tracker.record_failure("hetzner", now);
        assert!(tracker.is_excluded("hetzner", now));
        assert!(!tracker.is_excluded("vultr", now));
    }
}
