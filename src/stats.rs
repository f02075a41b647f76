//! Lifetime crawl statistics.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Read-only statistics snapshot.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub success_count: u64,
    pub failed_count: u64,
}

#[derive(Debug)]
struct StatsState {
    started_at: DateTime<Utc>,
    total_requests: u64,
    success_count: u64,
    failed_count: u64,
}

/// Accumulates across the orchestrator's lifetime; exposed only as a
/// snapshot copy.
#[derive(Debug)]
pub struct CrawlStats {
    inner: Mutex<StatsState>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsState {
                started_at: Utc::now(),
                total_requests: 0,
                success_count: 0,
                failed_count: 0,
            }),
        }
    }

    pub fn record_request(&self) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.total_requests += 1;
    }

    pub fn record_success(&self) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.success_count += 1;
    }

    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        guard.failed_count += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let guard = self.inner.lock().expect("stats lock poisoned");
        StatsSnapshot {
            started_at: guard.started_at,
            total_requests: guard.total_requests,
            success_count: guard.success_count,
            failed_count: guard.failed_count,
        }
    }
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_counts() {
        let stats = CrawlStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_success();
        stats.record_failure();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.failed_count, 1);
    }
}
