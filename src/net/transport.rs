//! Transport seam between the fetch layer and the concrete HTTP stack.
//!
//! `PageTransport` is the narrow interface sessions issue requests through;
//! `ReqwestTransport` is the production implementation. Batches are exercised
//! against scripted transports in tests, so everything above this seam stays
//! network-free under test.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

use crate::config::CrawlerConfig;
use crate::net::session::{BrowserIdentity, Session};

/// Transport-level failure. Timeouts and connection errors are both folded
/// into the transport error kind for circuit-breaking purposes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Raw response handed back to the fetch unit: status, body bytes, and the
/// effective URL after redirects.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub body: Bytes,
    pub url: Url,
}

impl RawPage {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// One HTTP GET with explicit identity and cookies. Cookies are passed per
/// request rather than through a client-owned store so the `_safe` token can
/// be refreshed between attempts without rebuilding the client.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        identity: &BrowserIdentity,
        cookies: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<RawPage, TransportError>;
}

/// Creates fresh sessions for the pool. The factory owns the transport
/// construction so tests can hand the pool scripted transports.
pub trait SessionFactory: Send + Sync {
    fn create(&self) -> Session;
}

/// Reqwest-backed transport used in production.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client honoring the configured proxy. Redirects are followed;
    /// the evasion layer inspects the final page, not intermediate hops.
    pub fn new(config: &CrawlerConfig) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .brotli(true);

        if let Some(endpoint) = &config.proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Connection(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &Url,
        identity: &BrowserIdentity,
        cookies: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        let mut request = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .header(http::header::USER_AGENT.as_str(), identity.user_agent());

        if !cookies.is_empty() {
            let header = cookies
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            if !header.is_empty() {
                request = request.header(http::header::COOKIE.as_str(), header);
            }
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Connection(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Connection(err.to_string()))?;

        Ok(RawPage {
            status,
            body,
            url: final_url,
        })
    }
}

/// Default factory: each session gets its own reqwest client so connections
/// and TLS state are never shared between concurrent borrowers.
pub struct ReqwestSessionFactory {
    config: CrawlerConfig,
}

impl ReqwestSessionFactory {
    pub fn new(config: CrawlerConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for ReqwestSessionFactory {
    fn create(&self) -> Session {
        let transport: Arc<dyn PageTransport> = match ReqwestTransport::new(&self.config) {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                // A broken proxy URL would already have failed at config
                // validation; surface the fallback loudly either way.
                log::error!("transport construction failed ({err}), using direct client");
                Arc::new(ReqwestTransport {
                    client: reqwest::Client::new(),
                })
            }
        };
        Session::new(transport, BrowserIdentity::mobile_safari())
    }
}
