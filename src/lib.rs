//! # gatecrawl
//!
//! A concurrent crawl engine for forums that fight back. The engine keeps a
//! fixed pool of browser-like sessions, paces requests adaptively, recovers
//! from interstitial challenges and age gates, and pulls the plug through a
//! sticky circuit breaker when the site starts serving decoys.
//!
//! ## Features
//!
//! - Fixed-size session pool with cookie continuity and lifetime bounds
//! - Adaptive pacing that slows down after consecutive failures
//! - Interstitial solver bridge, age-gate token replay, desktop fallback
//! - Time-window circuit breaker with operator alerts
//! - Cooperative and worker-pool batch orchestration
//! - External pause / resume / stop through a control bridge
//!
//! ## Example
//!
//! ```no_run
//! use gatecrawl::{Crawler, CrawlerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let crawler = Crawler::new(CrawlerConfig::default());
//!     if let Some(page) = crawler.fetch("https://forum.example.com/forum.php?mod=viewthread&tid=1").await {
//!         println!("{}", page.text());
//!     }
//! }
//! ```

pub mod batch;
pub mod config;
pub mod control;
mod crawler;
pub mod evasion;
pub mod guard;
pub mod net;
pub mod notify;
pub mod parse;
pub mod stats;

pub use crate::batch::WorkerPool;

pub use crate::config::{CrawlerConfig, CrawlerConfigBuilder, DelayRange};

pub use crate::control::{
    ControlAction,
    ControlBridge,
    ControlStatus,
    NoopControlBridge,
    PendingSignal,
    SignalKind,
    SignalQueueBridge,
};

pub use crate::crawler::{Crawler, CrawlerBuilder, FetchError, Page};

pub use crate::evasion::{
    EvasionEngine,
    EvasionError,
    PageClass,
    SolverClient,
    SolverError,
};

pub use crate::guard::{CircuitBreaker, RateController};

pub use crate::net::{
    BrowserIdentity,
    PageTransport,
    RawPage,
    ReqwestSessionFactory,
    ReqwestTransport,
    Session,
    SessionFactory,
    SessionPool,
    TransportError,
};

pub use crate::notify::{NoopNotifier, Notifier, StopAlert, WebhookNotifier};

pub use crate::stats::{CrawlStats, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
