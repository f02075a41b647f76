//! Reusable client sessions.
//!
//! A session bundles a transport handle, an explicit cookie map, and the
//! browser identity it presents. Sessions are owned exclusively by the pool
//! while idle and by exactly one fetch while borrowed; nothing here is
//! internally synchronized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use url::Url;

use crate::net::transport::{PageTransport, RawPage, TransportError};

/// Cookie name carrying the age-verification token.
pub const SAFE_COOKIE: &str = "_safe";

/// Immutable browser identity a request is issued under. Evasion branches
/// construct a new identity for fallback attempts instead of mutating shared
/// header state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    tag: &'static str,
    user_agent: &'static str,
}

impl BrowserIdentity {
    /// Default identity; the mobile profile has the higher success rate
    /// against the target site.
    pub fn mobile_safari() -> Self {
        Self {
            tag: "mobile_safari",
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 18_5 like Mac OS X) \
                 AppleWebKit/605.1.15 (KHTML, like Gecko) \
                 Version/18.5 Mobile/15E148 Safari/604.1",
        }
    }

    /// Desktop identity used by the interception fallback.
    pub fn desktop_chrome() -> Self {
        Self {
            tag: "desktop_chrome",
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                 AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/122.0.0.0 Safari/537.36",
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }
}

/// One pooled HTTP session: transport, cookies, identity, and lifetime
/// counters used for lazy retirement.
pub struct Session {
    transport: Arc<dyn PageTransport>,
    identity: BrowserIdentity,
    cookies: HashMap<String, String>,
    created_at: Instant,
    request_count: u32,
}

impl Session {
    pub fn new(transport: Arc<dyn PageTransport>, identity: BrowserIdentity) -> Self {
        let mut cookies = HashMap::new();
        cookies.insert(SAFE_COOKIE.to_string(), String::new());
        Self {
            transport,
            identity,
            cookies,
            created_at: Instant::now(),
            request_count: 0,
        }
    }

    /// Issue a GET under this session's own identity.
    pub async fn get(&mut self, url: &Url, timeout: Duration) -> Result<RawPage, TransportError> {
        let identity = self.identity.clone();
        self.get_as(url, &identity, timeout).await
    }

    /// Issue a GET under an explicit identity without touching the session's
    /// default one (fallback attempts discard the override afterwards).
    pub async fn get_as(
        &mut self,
        url: &Url,
        identity: &BrowserIdentity,
        timeout: Duration,
    ) -> Result<RawPage, TransportError> {
        self.request_count = self.request_count.saturating_add(1);
        self.transport
            .get(url, identity, &self.cookies, timeout)
            .await
    }

    pub fn identity(&self) -> &BrowserIdentity {
        &self.identity
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    /// Overlay cookies carried between sessions (the shared `_safe` token).
    pub fn merge_cookies(&mut self, shared: &HashMap<String, String>) {
        for (name, value) in shared {
            if !value.is_empty() {
                self.cookies.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// Whether this session has exceeded its lifetime or request budget.
    pub fn expired(&self, max_age: Duration, max_requests: u32) -> bool {
        self.age() >= max_age || self.request_count >= max_requests
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity.tag)
            .field("age", &self.age())
            .field("request_count", &self.request_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NullTransport;

    #[async_trait]
    impl PageTransport for NullTransport {
        async fn get(
            &self,
            url: &Url,
            _identity: &BrowserIdentity,
            _cookies: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<RawPage, TransportError> {
            Ok(RawPage {
                status: 200,
                body: Bytes::new(),
                url: url.clone(),
            })
        }
    }

    #[tokio::test]
    async fn counts_requests_and_expires() {
        let mut session = Session::new(Arc::new(NullTransport), BrowserIdentity::mobile_safari());
        let url = Url::parse("https://example.com/").unwrap();
        session.get(&url, Duration::from_secs(1)).await.unwrap();
        session.get(&url, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.request_count(), 2);
        assert!(!session.expired(Duration::from_secs(3600), 1000));
        assert!(session.expired(Duration::from_secs(3600), 2));
        assert!(session.expired(Duration::ZERO, 1000));
    }

    #[test]
    fn merge_skips_empty_values() {
        let mut session = Session::new(Arc::new(NullTransport), BrowserIdentity::mobile_safari());
        let mut shared = HashMap::new();
        shared.insert(SAFE_COOKIE.to_string(), String::new());
        shared.insert("token".to_string(), "abc".to_string());
        session.merge_cookies(&shared);
        assert_eq!(session.cookie("token"), Some("abc"));
        assert_eq!(session.cookie(SAFE_COOKIE), Some(""));
    }
}
