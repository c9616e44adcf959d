//! Statistics tracking for the proxy.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

/// Atomic request counters plus a per-upstream tally of answers.
pub struct Stats {
    pub requests: AtomicU64,
    pub cached: AtomicU64,
    pub forwarded: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
    upstream_answers: Mutex<FxHashMap<String, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            upstream_answers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn record_cached(&self, response_time_ms: f64) {
        self.count(&self.cached, response_time_ms);
    }

    pub fn record_forwarded(&self, response_time_ms: f64, upstream: &str) {
        self.count(&self.forwarded, response_time_ms);
        if let Ok(mut answers) = self.upstream_answers.lock() {
            *answers.entry(upstream.to_string()).or_default() += 1;
        }
    }

    /// Every upstream failed.
    pub fn record_failed(&self, response_time_ms: f64) {
        self.count(&self.failed, response_time_ms);
    }

    /// The request was rejected or errored before an answer was built.
    pub fn record_dropped(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn count(&self, counter: &AtomicU64, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let answered = requests.saturating_sub(dropped);
        let avg_response_ms = if answered > 0 {
            (total_us as f64 / answered as f64) / 1000.0
        } else {
            0.0
        };

        let top_upstream = self.upstream_answers.lock().ok().and_then(|mut answers| {
            let top = answers
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(name, count)| (name.clone(), *count));
            answers.clear();
            top
        });

        StatsSnapshot {
            requests,
            cached,
            forwarded,
            failed,
            dropped,
            avg_response_ms,
            top_upstream,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub dropped: u64,
    pub avg_response_ms: f64,
    /// Upstream with the most answers in the window.
    pub top_upstream: Option<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_and_averages() {
        let stats = Stats::new();
        stats.record_cached(1.0);
        stats.record_forwarded(3.0, "Google");
        stats.record_failed(5.0);
        stats.record_dropped();

        let snapshot = stats.snapshot_and_reset();

        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.cached, 1);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.dropped, 1);
        assert!((snapshot.avg_response_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record_forwarded(2.0, "Dyn");
        stats.snapshot_and_reset();

        let snapshot = stats.snapshot_and_reset();

        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.avg_response_ms, 0.0);
        assert_eq!(snapshot.top_upstream, None);
    }

    #[test]
    fn top_upstream_is_most_used() {
        let stats = Stats::new();
        stats.record_forwarded(1.0, "Dyn");
        stats.record_forwarded(1.0, "Google");
        stats.record_forwarded(1.0, "Google");

        assert_eq!(
            stats.snapshot_and_reset().top_upstream,
            Some(("Google".to_string(), 2))
        );
    }
}
