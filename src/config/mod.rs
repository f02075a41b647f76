//! Crawler configuration.
//!
//! Every tunable the engine consumes is read once at construction time; there
//! is no hot reload. The defaults are empirical values observed against the
//! target site's defenses and are deliberately preserved as-is.

use std::time::Duration;

/// Delay range sampled uniformly before each request attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn from_secs_f64(min: f64, max: f64) -> Self {
        Self {
            min: Duration::from_secs_f64(min),
            max: Duration::from_secs_f64(max),
        }
    }
}

/// Complete configuration consumed by [`crate::Crawler`] and
/// [`crate::WorkerPool`].
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Fixed session pool size; the pool never grows past this.
    pub pool_size: usize,
    /// How long `acquire` waits for a pooled session before fabricating one.
    pub session_acquire_timeout: Duration,
    /// Sessions older than this are retired on next borrow or release.
    pub session_max_age: Duration,
    /// Sessions that served this many requests are retired.
    pub session_max_requests: u32,
    /// Soft per-request timeout handed to the transport.
    pub request_timeout: Duration,
    /// Margin added to the soft timeout for the caller-enforced hard ceiling.
    pub hard_timeout_margin: Duration,
    /// Retry attempts per URL inside the fetch unit.
    pub max_retries: u32,
    /// Delay bounds while the rate controller is in normal mode.
    pub normal_delay: DelayRange,
    /// Delay bounds while the rate controller is in slow mode.
    pub slow_delay: DelayRange,
    /// Consecutive failures before the rate controller enters slow mode.
    pub failure_threshold: u32,
    /// Per-kind error count that trips the circuit breaker.
    pub error_threshold: usize,
    /// Sliding window length for breaker error counting.
    pub error_window: Duration,
    /// Maximum timestamps retained per error kind.
    pub error_window_cap: usize,
    /// Admission gate width for the cooperative batch variant.
    pub max_concurrency: usize,
    /// Worker count for the worker-pool batch variant.
    pub worker_count: usize,
    /// Per-task result timeout in the worker-pool variant.
    pub task_timeout: Duration,
    /// Body size above which a fallback response counts as real content even
    /// without a matched title.
    pub content_size_floor: usize,
    /// Keywords that mark a healthy page title.
    pub title_markers: Vec<String>,
    /// Sleep range between the laundering request and the desktop re-issue.
    pub launder_delay: DelayRange,
    /// Iteration cap for the challenge-bypass re-gate loop.
    pub max_bypass_rounds: u32,
    /// Upstream proxy for all transports.
    pub proxy: Option<String>,
    /// Verification-solving endpoint; challenge interstitials fail without it.
    pub solver_url: Option<String>,
    /// Best-effort alert endpoint used when the breaker trips.
    pub notify_url: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            session_acquire_timeout: Duration::from_secs(10),
            session_max_age: Duration::from_secs(2 * 3600),
            session_max_requests: 1000,
            request_timeout: Duration::from_secs(30),
            hard_timeout_margin: Duration::from_secs(15),
            max_retries: 3,
            normal_delay: DelayRange::from_secs_f64(0.3, 0.8),
            slow_delay: DelayRange::from_secs_f64(1.0, 3.0),
            failure_threshold: 3,
            error_threshold: 15,
            error_window: Duration::from_secs(300),
            error_window_cap: 100,
            max_concurrency: 20,
            worker_count: 10,
            task_timeout: Duration::from_secs(30),
            content_size_floor: 50_000,
            title_markers: vec![
                "98堂".to_string(),
                "门户".to_string(),
                "forum".to_string(),
                "Discuz".to_string(),
            ],
            launder_delay: DelayRange::from_secs_f64(1.5, 3.5),
            max_bypass_rounds: 3,
            proxy: None,
            solver_url: None,
            notify_url: None,
        }
    }
}

impl CrawlerConfig {
    /// Hard ceiling applied by the fetch unit around each transport call.
    pub fn hard_timeout(&self) -> Duration {
        self.request_timeout + self.hard_timeout_margin
    }
}

/// Fluent builder mirroring the configuration fields the operator commonly
/// overrides.
#[derive(Debug, Default)]
pub struct CrawlerConfigBuilder {
    config: CrawlerConfig,
}

impl CrawlerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size.max(1);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries.max(1);
        self
    }

    pub fn normal_delay(mut self, range: DelayRange) -> Self {
        self.config.normal_delay = range;
        self
    }

    pub fn slow_delay(mut self, range: DelayRange) -> Self {
        self.config.slow_delay = range;
        self
    }

    pub fn error_threshold(mut self, threshold: usize) -> Self {
        self.config.error_threshold = threshold.max(1);
        self
    }

    pub fn error_window(mut self, window: Duration) -> Self {
        self.config.error_window = window;
        self
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.config.max_concurrency = limit.max(1);
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers.max(1);
        self
    }

    pub fn title_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.title_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn solver_url(mut self, url: impl Into<String>) -> Self {
        self.config.solver_url = Some(url.into());
        self
    }

    pub fn notify_url(mut self, url: impl Into<String>) -> Self {
        self.config.notify_url = Some(url.into());
        self
    }

    pub fn build(self) -> CrawlerConfig {
        self.config
    }
}
