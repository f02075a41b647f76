//! Fetch orchestration.
//!
//! [`Crawler`] composes the session pool, rate controller, evasion engine,
//! and circuit breaker into a single "fetch one URL" operation, and layers
//! the cooperative batch variant on top: many fetches interleaved on the
//! runtime, gated by a counting admission semaphore, output in input order.
//!
//! All fetch-level failures are absorbed here. Callers only ever see a page
//! or an absent result; the one escape valve is the breaker's sticky stop.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, timeout};
use url::Url;

use crate::config::CrawlerConfig;
use crate::control::{ControlAction, ControlBridge, NoopControlBridge};
use crate::evasion::{EvasionEngine, EvasionError};
use crate::guard::{CircuitBreaker, RateController};
use crate::net::{ReqwestSessionFactory, SessionFactory, SessionPool};
use crate::notify::{self, Notifier};
use crate::stats::{CrawlStats, StatsSnapshot};

/// Interval between control polls while paused.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Successful fetch payload: page bytes plus the effective final URL.
#[derive(Debug, Clone)]
pub struct Page {
    pub body: Bytes,
    pub url: Url,
}

impl Page {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Internal failure of one fetch attempt. Never escapes the fetch unit;
/// collapsed into an error kind for the breaker and a retry decision.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::net::TransportError),
    #[error("hard timeout exceeded ({0:?})")]
    HardTimeout(Duration),
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error(transparent)]
    Evasion(#[from] EvasionError),
}

impl FetchError {
    fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) | FetchError::HardTimeout(_) => "transport_error",
            FetchError::HttpStatus(_) => "http_status",
            FetchError::Evasion(err) => err.kind(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            FetchError::Evasion(err) => err.retryable(),
            _ => true,
        }
    }
}

/// Builder wiring the collaborators a crawler consumes but does not own.
pub struct CrawlerBuilder {
    config: CrawlerConfig,
    bridge: Arc<dyn ControlBridge>,
    notifier: Option<Arc<dyn Notifier>>,
    factory: Option<Arc<dyn SessionFactory>>,
}

impl CrawlerBuilder {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            bridge: Arc::new(NoopControlBridge),
            notifier: None,
            factory: None,
        }
    }

    /// Attach a control bridge; the default never reports a signal.
    pub fn with_control_bridge(mut self, bridge: Arc<dyn ControlBridge>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the session factory (tests inject scripted transports here).
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Crawler {
        let notifier = self
            .notifier
            .unwrap_or_else(|| notify::from_config(self.config.notify_url.as_deref()));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(ReqwestSessionFactory::new(self.config.clone())));

        let pool = SessionPool::new(&self.config, factory);
        let engine = EvasionEngine::new(&self.config);
        let rate = StdMutex::new(RateController::new(&self.config));
        let breaker = CircuitBreaker::new(&self.config, notifier);
        let admission = Semaphore::new(self.config.max_concurrency.max(1));

        Crawler {
            config: self.config,
            pool,
            engine,
            rate,
            breaker,
            bridge: self.bridge,
            stats: CrawlStats::new(),
            admission,
            control_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }
}

/// Crawl engine instance. Run state (stop flag, failure streak, statistics)
/// is owned per instance, never process-wide; independent crawlers do not
/// observe each other.
pub struct Crawler {
    config: CrawlerConfig,
    pool: Arc<SessionPool>,
    engine: EvasionEngine,
    rate: StdMutex<RateController>,
    breaker: CircuitBreaker,
    bridge: Arc<dyn ControlBridge>,
    stats: CrawlStats,
    admission: Semaphore,
    // Serializes control-signal processing so two fetches cannot consume
    // the same pause/stop transition twice.
    control_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl Crawler {
    pub fn new(config: CrawlerConfig) -> Self {
        CrawlerBuilder::new(config).build()
    }

    pub fn builder(config: CrawlerConfig) -> CrawlerBuilder {
        CrawlerBuilder::new(config)
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Lifetime statistics snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the run is over: breaker tripped or external stop observed.
    pub fn should_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.breaker.tripped()
    }

    /// Fetch one URL with the configured retry budget.
    pub async fn fetch(&self, url: &str) -> Option<Page> {
        self.fetch_with_retries(url, self.config.max_retries).await
    }

    /// Fetch one URL with an explicit retry budget.
    pub async fn fetch_with_retries(&self, url: &str, max_retries: u32) -> Option<Page> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::error!("unfetchable URL '{url}': {err}");
                return None;
            }
        };

        for attempt in 0..max_retries.max(1) {
            if self.handle_control().await {
                return None;
            }

            let delay = {
                let rate = self.rate.lock().expect("rate lock poisoned");
                rate.next_delay(attempt)
            };
            sleep(delay).await;

            if self.handle_control().await {
                return None;
            }

            // Admission gate: at most `max_concurrency` fetches past this
            // point. The semaphore is never closed, so acquire cannot fail.
            let Ok(_permit) = self.admission.acquire().await else {
                return None;
            };

            self.stats.record_request();
            match self.attempt(&parsed).await {
                Ok(page) => {
                    self.rate.lock().expect("rate lock poisoned").record_success();
                    self.stats.record_success();
                    log::debug!("fetched {url}");
                    return Some(page);
                }
                Err(err) => {
                    self.rate.lock().expect("rate lock poisoned").record_failure();
                    if self.breaker.record_error_kind(err.kind()) {
                        self.stats.record_failure();
                        return None;
                    }
                    if !err.retryable() || attempt + 1 == max_retries.max(1) {
                        self.stats.record_failure();
                        log::error!("giving up on {url}: {err}");
                        return None;
                    }
                    log::warn!(
                        "retry {}/{} for {url}: {err}",
                        attempt + 1,
                        max_retries.max(1)
                    );
                }
            }
        }
        None
    }

    /// One attempt: borrow a session, issue the request under the hard
    /// timeout ceiling, run the evasion engine over the response. The
    /// session returns to the pool when the guard drops, on every path.
    async fn attempt(&self, url: &Url) -> Result<Page, FetchError> {
        let mut session = self.pool.acquire().await;
        session.merge_cookies(&self.engine.shared_cookies());

        let hard_timeout = self.config.hard_timeout();
        let raw = match timeout(
            hard_timeout,
            session.get(url, self.config.request_timeout),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => return Err(FetchError::Transport(err)),
            Err(_) => return Err(FetchError::HardTimeout(hard_timeout)),
        };

        if raw.status >= 400 {
            return Err(FetchError::HttpStatus(raw.status));
        }

        let verified = self.engine.verify(&mut session, url, raw).await?;
        if verified.status >= 400 {
            return Err(FetchError::HttpStatus(verified.status));
        }

        Ok(Page {
            body: verified.body,
            url: verified.url,
        })
    }

    /// Cooperative batch variant: all URLs in flight behind the admission
    /// gate, output order equals input order.
    pub async fn fetch_many(&self, urls: &[String]) -> Vec<Option<Page>> {
        log::info!("starting batch of {} URLs", urls.len());

        if self.handle_control().await {
            log::warn!("stop observed before dispatch, skipping {} items", urls.len());
            return urls.iter().map(|_| None).collect();
        }

        let futures = urls.iter().map(|url| self.fetch(url));
        let results = futures::future::join_all(futures).await;

        if self.should_stop() {
            let skipped = results.iter().filter(|result| result.is_none()).count();
            log::warn!("batch short-circuited by stop, {skipped} items absent");
        }

        let succeeded = results.iter().filter(|result| result.is_some()).count();
        log::info!("batch complete: {succeeded}/{} succeeded", urls.len());
        results
    }

    /// Poll the control bridge. Returns true when the run must stop. Pause
    /// blocks here cooperatively until resumed or stopped; in-flight
    /// requests are never aborted, the check happens between attempts.
    pub(crate) async fn handle_control(&self) -> bool {
        if self.should_stop() {
            return true;
        }

        // Cheap pre-check before taking the serialized control path.
        let status = self.bridge.current_state();
        let has_pending = self
            .bridge
            .pending_signals()
            .iter()
            .any(|signal| !signal.processed);
        if !has_pending && !status.is_paused {
            return false;
        }

        let _guard = self.control_lock.lock().await;
        if self.should_stop() {
            return true;
        }

        match self.bridge.check_control_signals() {
            ControlAction::Stop => {
                self.stopped.store(true, Ordering::SeqCst);
                log::info!("stop signal received, halting further requests");
                true
            }
            ControlAction::Pause => self.wait_while_paused().await,
            ControlAction::Resume | ControlAction::None => {
                if self.bridge.current_state().is_paused {
                    self.wait_while_paused().await
                } else {
                    false
                }
            }
        }
    }

    /// Block until the bridge reports resume or stop. Returns true on stop.
    async fn wait_while_paused(&self) -> bool {
        log::info!("paused, waiting for resume");
        loop {
            sleep(PAUSE_POLL_INTERVAL).await;

            match self.bridge.check_control_signals() {
                ControlAction::Stop => {
                    self.stopped.store(true, Ordering::SeqCst);
                    log::info!("stop received while paused");
                    return true;
                }
                ControlAction::Resume => {
                    log::info!("resumed");
                    return false;
                }
                ControlAction::Pause | ControlAction::None => {}
            }

            let status = self.bridge.current_state();
            if !status.is_paused {
                if status.current_state == "idle" {
                    self.stopped.store(true, Ordering::SeqCst);
                    log::info!("run went idle while paused, stopping");
                    return true;
                }
                log::info!("resumed (state change)");
                return false;
            }
        }
    }
}
