//! Sliding-window circuit breaker.
//!
//! Counts occurrences of each distinct error kind in a trailing time window.
//! When any kind reaches the threshold the breaker trips: the stop flag is
//! sticky for the lifetime of the instance and every later check reports
//! "stop" regardless of kind, because a run that tripped once is considered
//! unsafe to continue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::CrawlerConfig;
use crate::notify::{Notifier, StopAlert};

struct BreakerWindows {
    windows: HashMap<String, VecDeque<Instant>>,
}

pub struct CircuitBreaker {
    threshold: usize,
    window: Duration,
    window_cap: usize,
    // Lock scopes the append + evict + count sequence; the sticky flag is
    // read lock-free on the hot path.
    state: Mutex<BreakerWindows>,
    tripped: AtomicBool,
    notifier: Arc<dyn Notifier>,
}

impl CircuitBreaker {
    pub fn new(config: &CrawlerConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            threshold: config.error_threshold.max(1),
            window: config.error_window,
            window_cap: config.error_window_cap.max(1),
            state: Mutex::new(BreakerWindows {
                windows: HashMap::new(),
            }),
            tripped: AtomicBool::new(false),
            notifier,
        }
    }

    /// Record one occurrence of an error kind. Returns true when crawling
    /// must stop (either this record tripped the breaker, or it already
    /// tripped earlier).
    pub fn record_error_kind(&self, kind: &str) -> bool {
        self.record_at(kind, Instant::now())
    }

    pub(crate) fn record_at(&self, kind: &str, now: Instant) -> bool {
        if self.tripped() {
            return true;
        }

        let count = {
            let mut guard = self.state.lock().expect("breaker lock poisoned");
            let window = guard.windows.entry(kind.to_string()).or_default();

            if window.len() == self.window_cap {
                window.pop_front();
            }
            window.push_back(now);

            // Purge entries older than the window before counting, so the
            // count always reflects a true trailing-window population.
            let horizon = now.checked_sub(self.window).unwrap_or(now);
            while window.front().is_some_and(|first| *first < horizon) {
                window.pop_front();
            }
            window.len()
        };

        if count >= self.threshold {
            self.tripped.store(true, Ordering::SeqCst);
            log::error!(
                "error kind '{kind}' occurred {count} times within {:?}, stopping the crawl",
                self.window
            );
            let alert = StopAlert::new(kind, count, self.threshold);
            self.notifier.notify(&alert);
            return true;
        }

        // Surface the trend every fifth occurrence without flooding the log.
        if count % 5 == 0 {
            log::warn!("error kind '{kind}' occurred {count} times within the window");
        }
        false
    }

    /// Whether the sticky stop flag is set.
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Current in-window count for one kind, for diagnostics.
    pub fn count(&self, kind: &str) -> usize {
        let guard = self.state.lock().expect("breaker lock poisoned");
        guard.windows.get(kind).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use std::sync::atomic::AtomicUsize;

    struct CountingNotifier {
        sent: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _alert: &StopAlert) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn breaker_with_threshold(threshold: usize) -> CircuitBreaker {
        let config = CrawlerConfig {
            error_threshold: threshold,
            ..CrawlerConfig::default()
        };
        CircuitBreaker::new(&config, Arc::new(NoopNotifier))
    }

    #[test]
    fn trips_at_threshold_and_stays_tripped() {
        let breaker = breaker_with_threshold(3);
        assert!(!breaker.record_error_kind("transport_error"));
        assert!(!breaker.record_error_kind("transport_error"));
        assert!(breaker.record_error_kind("transport_error"));
        assert!(breaker.tripped());
        // Any kind reports stop once tripped.
        assert!(breaker.record_error_kind("content_interception"));
    }

    #[test]
    fn distinct_kinds_count_separately() {
        let breaker = breaker_with_threshold(3);
        assert!(!breaker.record_error_kind("a"));
        assert!(!breaker.record_error_kind("b"));
        assert!(!breaker.record_error_kind("a"));
        assert!(!breaker.record_error_kind("b"));
        assert_eq!(breaker.count("a"), 2);
        assert!(!breaker.tripped());
    }

    #[test]
    fn old_entries_never_count_toward_threshold() {
        let breaker = breaker_with_threshold(3);
        let start = Instant::now();
        assert!(!breaker.record_at("kind", start));
        // Advance simulated time past the window, then feed threshold - 1
        // more: the stale first entry must not trip the breaker.
        let later = start + Duration::from_secs(301);
        assert!(!breaker.record_at("kind", later));
        assert!(!breaker.record_at("kind", later + Duration::from_secs(1)));
        assert!(!breaker.tripped());
        assert_eq!(breaker.count("kind"), 2);
    }

    #[test]
    fn window_is_capped() {
        let config = CrawlerConfig {
            error_threshold: 1000,
            error_window_cap: 100,
            ..CrawlerConfig::default()
        };
        let breaker = CircuitBreaker::new(&config, Arc::new(NoopNotifier));
        let now = Instant::now();
        for _ in 0..250 {
            breaker.record_at("kind", now);
        }
        assert_eq!(breaker.count("kind"), 100);
    }

    #[test]
    fn notifies_exactly_once_on_trip() {
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicUsize::new(0),
        });
        let config = CrawlerConfig {
            error_threshold: 2,
            ..CrawlerConfig::default()
        };
        let breaker = CircuitBreaker::new(&config, notifier.clone());
        breaker.record_error_kind("kind");
        breaker.record_error_kind("kind");
        breaker.record_error_kind("kind");
        breaker.record_error_kind("other");
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }
}
