//! Block-recovery state machine.
//!
//! Given a raw response, the engine classifies it and walks the recovery
//! branches in a fixed order: challenge interstitial, age gate, healthy
//! marker, then the desktop fallback for anything else. Every branch either
//! produces a verified page or a typed failure the fetch unit feeds into
//! the circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::config::{CrawlerConfig, DelayRange};
use crate::evasion::detectors::{
    self, AGE_GATE_BODY_MARKER, PageClass, is_bare_listing, launder_url, to_desktop_url,
};
use crate::evasion::interstitial::{SolverClient, SolverError};
use crate::net::session::{BrowserIdentity, SAFE_COOKIE, Session};
use crate::net::transport::{RawPage, TransportError};
use crate::parse;

/// Ceiling for the token-bearing re-issue. A gate that ignores a valid token
/// never recovers by waiting, so this request fails fast regardless of the
/// configured soft timeout.
const REISSUE_TIMEOUT: Duration = Duration::from_secs(15);

/// Terminal failure of one verification pass.
#[derive(Debug, Error)]
pub enum EvasionError {
    #[error("transport error during recovery: {0}")]
    Transport(#[from] TransportError),
    #[error("challenge bypass failed: {0}")]
    Bypass(#[from] SolverError),
    #[error("age gate persisted after token re-issue (title '{title}')")]
    AgeGate { title: String },
    #[error("age gate detected but no token found in page")]
    TokenExtraction,
    #[error("intercepted block page (title '{title}')")]
    Intercepted { title: String },
}

impl EvasionError {
    /// Error kind string recorded in the circuit breaker.
    pub fn kind(&self) -> &'static str {
        match self {
            EvasionError::Transport(_) => "transport_error",
            EvasionError::Bypass(_) | EvasionError::AgeGate { .. } => "challenge_verification",
            EvasionError::TokenExtraction => "token_extraction",
            EvasionError::Intercepted { .. } => "content_interception",
        }
    }

    /// Whether the fetch unit's retry loop may re-attempt from scratch. A
    /// missing token is fatal for the URL; everything else may clear up on
    /// a fresh request.
    pub fn retryable(&self) -> bool {
        !matches!(self, EvasionError::TokenExtraction)
    }
}

/// Classification-and-recovery engine shared by all fetch units of one
/// orchestrator.
pub struct EvasionEngine {
    markers: Vec<String>,
    size_floor: usize,
    launder_delay: DelayRange,
    max_bypass_rounds: u32,
    request_timeout: Duration,
    solver: Option<SolverClient>,
    // Shared jar for the `_safe` token. Dedicated lock, distinct from any
    // admission gate, so a token refresh never blocks unrelated fetches.
    shared_cookies: Arc<Mutex<HashMap<String, String>>>,
}

impl EvasionEngine {
    pub fn new(config: &CrawlerConfig) -> Self {
        let solver = config
            .solver_url
            .as_ref()
            .map(|endpoint| SolverClient::new(endpoint, config.proxy.clone()));
        Self {
            markers: config.title_markers.clone(),
            size_floor: config.content_size_floor,
            launder_delay: config.launder_delay,
            max_bypass_rounds: config.max_bypass_rounds.max(1),
            request_timeout: config.request_timeout,
            solver,
            shared_cookies: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot of the shared cookie jar, merged into a session before its
    /// first request so a token solved by one fetch benefits the others.
    pub fn shared_cookies(&self) -> HashMap<String, String> {
        self.shared_cookies
            .lock()
            .expect("cookie jar lock poisoned")
            .clone()
    }

    /// Run the state machine over a raw response, issuing recovery requests
    /// through the borrowed session as needed.
    pub async fn verify(
        &self,
        session: &mut Session,
        url: &Url,
        page: RawPage,
    ) -> Result<RawPage, EvasionError> {
        let body = page.text();
        let title = parse::page_title(&body);

        match detectors::classify(&title, &body, &self.markers) {
            PageClass::Healthy => {
                log::debug!("page verified by title marker: {url}");
                Ok(page)
            }
            PageClass::ChallengeInterstitial => {
                log::info!("challenge interstitial detected, invoking solver: {url}");
                let solved = self.bypass_interstitial(session, url).await?;
                self.finish_after_bypass(session, url, solved).await
            }
            PageClass::AgeGate => {
                log::info!("age gate detected, extracting token: {url}");
                self.bypass_age_gate(session, url, &body).await
            }
            PageClass::Suspect { title } => {
                if is_bare_listing(url) {
                    // Known dead pattern; the fallback never rescues it, so
                    // skip the extra round-trips.
                    return Err(EvasionError::Intercepted { title });
                }
                log::warn!("interception page detected ('{title}'), trying desktop fallback");
                self.desktop_fallback(session, url).await
            }
        }
    }

    /// Challenge bypass through the external solver, iterating while the
    /// solved page re-enters the age gate, up to a hard cap.
    async fn bypass_interstitial(
        &self,
        session: &mut Session,
        url: &Url,
    ) -> Result<RawPage, EvasionError> {
        let solver = self.solver.as_ref().ok_or(SolverError::Unconfigured)?;

        for _round in 0..self.max_bypass_rounds {
            let html = solver.solve(url, session.cookies()).await?;
            if html.contains(AGE_GATE_BODY_MARKER) {
                let Some(token) = parse::extract_safeid(&html) else {
                    return Err(EvasionError::TokenExtraction);
                };
                self.store_token(session, &token);
                continue;
            }
            return Ok(RawPage {
                status: 200,
                body: Bytes::from(html),
                url: url.clone(),
            });
        }
        Err(EvasionError::Bypass(SolverError::StillGated(
            self.max_bypass_rounds,
        )))
    }

    /// The solved page may still need the rest of the chain (age gate,
    /// marker check, desktop fallback); only the interstitial branch is
    /// consumed at this point, so re-enter the machine body-first.
    async fn finish_after_bypass(
        &self,
        session: &mut Session,
        url: &Url,
        page: RawPage,
    ) -> Result<RawPage, EvasionError> {
        let body = page.text();
        let title = parse::page_title(&body);
        match detectors::classify(&title, &body, &self.markers) {
            PageClass::Healthy => Ok(page),
            PageClass::AgeGate => self.bypass_age_gate(session, url, &body).await,
            PageClass::Suspect { .. } => self.desktop_fallback(session, url).await,
            // A solved page that is itself another interstitial means the
            // solver failed; the bypass loop already spent its rounds.
            PageClass::ChallengeInterstitial => Err(EvasionError::AgeGate { title }),
        }
    }

    /// Extract the token, propagate it to the session and the shared jar,
    /// and re-issue the request exactly once.
    async fn bypass_age_gate(
        &self,
        session: &mut Session,
        url: &Url,
        body: &str,
    ) -> Result<RawPage, EvasionError> {
        let Some(token) = parse::extract_safeid(body) else {
            return Err(EvasionError::TokenExtraction);
        };
        let preview: String = token.chars().take(8).collect();
        log::debug!("age-gate token extracted: {preview}...");
        self.store_token(session, &token);

        let retried = session
            .get(url, self.request_timeout.min(REISSUE_TIMEOUT))
            .await?;
        let retried_body = retried.text();
        let title = parse::page_title(&retried_body);
        if detectors::title_matches(&title, &self.markers) {
            log::debug!("age gate bypassed: {url}");
            Ok(retried)
        } else {
            Err(EvasionError::AgeGate { title })
        }
    }

    /// Last-resort recovery: present a desktop identity, strip the mobile
    /// flag from the URL, launder the session against the site home page,
    /// then re-issue. The desktop identity is scoped to this branch; the
    /// session's own identity is never touched.
    async fn desktop_fallback(
        &self,
        session: &mut Session,
        url: &Url,
    ) -> Result<RawPage, EvasionError> {
        let desktop = BrowserIdentity::desktop_chrome();
        let desktop_url = to_desktop_url(url);

        if let Some(home) = launder_url(url) {
            // Throwaway request; its outcome is irrelevant.
            let _ = session.get_as(&home, &desktop, self.request_timeout).await;
        }

        tokio::time::sleep(sample(self.launder_delay)).await;

        let retried = session
            .get_as(&desktop_url, &desktop, self.request_timeout)
            .await?;
        let body = retried.text();
        let title = parse::page_title(&body);

        // A large body counts as real content even when the title matches
        // no marker.
        if detectors::title_matches(&title, &self.markers) || retried.body.len() > self.size_floor {
            log::info!("desktop fallback succeeded: {desktop_url}");
            Ok(retried)
        } else {
            log::warn!("desktop fallback failed ('{title}'): {desktop_url}");
            Err(EvasionError::Intercepted { title })
        }
    }

    fn store_token(&self, session: &mut Session, token: &str) {
        session.set_cookie(SAFE_COOKIE, token);
        let mut jar = self.shared_cookies.lock().expect("cookie jar lock poisoned");
        jar.insert(SAFE_COOKIE.to_string(), token.to_string());
    }
}

fn sample(range: DelayRange) -> Duration {
    if range.max <= range.min {
        return range.min;
    }
    let secs = rand::thread_rng().gen_range(range.min.as_secs_f64()..=range.max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::PageTransport;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport returning a scripted sequence of responses.
    struct ScriptedTransport {
        responses: StdMutex<Vec<RawPage>>,
        calls: StdMutex<Vec<(Url, &'static str, HashMap<String, String>)>>,
        timeouts: StdMutex<Vec<Duration>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<RawPage>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses),
                calls: StdMutex::new(Vec::new()),
                timeouts: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call(&self, index: usize) -> (Url, &'static str, HashMap<String, String>) {
            self.calls.lock().unwrap()[index].clone()
        }

        fn timeout(&self, index: usize) -> Duration {
            self.timeouts.lock().unwrap()[index]
        }
    }

    #[async_trait]
    impl PageTransport for ScriptedTransport {
        async fn get(
            &self,
            url: &Url,
            identity: &BrowserIdentity,
            cookies: &HashMap<String, String>,
            timeout: Duration,
        ) -> Result<RawPage, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.clone(), identity.tag(), cookies.clone()));
            self.timeouts.lock().unwrap().push(timeout);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(TransportError::Connection("script exhausted".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    fn page(url: &Url, html: &str) -> RawPage {
        RawPage {
            status: 200,
            body: Bytes::from(html.to_string()),
            url: url.clone(),
        }
    }

    fn engine() -> EvasionEngine {
        let config = CrawlerConfig {
            launder_delay: DelayRange::from_secs_f64(0.0, 0.0),
            ..CrawlerConfig::default()
        };
        EvasionEngine::new(&config)
    }

    const HEALTHY: &str = "<html><head><title>Discuz! Board</title></head><body>ok</body></html>";

    fn thread_url() -> Url {
        Url::parse("https://example.com/forum.php?mod=viewthread&tid=7&mobile=2").unwrap()
    }

    #[tokio::test]
    async fn healthy_page_passes_through() {
        let transport = ScriptedTransport::new(vec![]);
        let mut session = Session::new(transport.clone(), BrowserIdentity::mobile_safari());
        let url = thread_url();
        let result = engine().verify(&mut session, &url, page(&url, HEALTHY)).await;
        assert!(result.is_ok());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn age_gate_reissues_once_with_token() {
        let url = thread_url();
        let gated = r#"<html><head><title>18+</title></head>
            <body><script>var safeid = 'tok123';</script></body></html>"#;
        let transport = ScriptedTransport::new(vec![page(&url, HEALTHY)]);
        let mut session = Session::new(transport.clone(), BrowserIdentity::mobile_safari());

        let eng = engine();
        let result = eng.verify(&mut session, &url, page(&url, gated)).await;
        assert!(result.is_ok());
        assert_eq!(transport.call_count(), 1);
        assert_eq!(session.cookie(SAFE_COOKIE), Some("tok123"));
        assert_eq!(
            eng.shared_cookies().get(SAFE_COOKIE).map(String::as_str),
            Some("tok123")
        );
        // Re-issue carried the token, under the pinned short ceiling.
        let (_, _, cookies) = transport.call(0);
        assert_eq!(cookies.get(SAFE_COOKIE).map(String::as_str), Some("tok123"));
        assert_eq!(transport.timeout(0), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn bypassed_page_without_marker_falls_back_to_desktop() {
        let url = thread_url();
        let suspect = page(
            &url,
            "<html><head><title>nameless</title></head><body></body></html>",
        );
        let transport = ScriptedTransport::new(vec![
            page(&Url::parse("https://example.com/forum.php").unwrap(), "<html/>"),
            page(&url, HEALTHY),
        ]);
        let mut session = Session::new(transport.clone(), BrowserIdentity::mobile_safari());

        let result = engine()
            .finish_after_bypass(&mut session, &url, suspect)
            .await;
        assert!(result.is_ok());
        assert_eq!(transport.call_count(), 2);
        let (_, identity, _) = transport.call(1);
        assert_eq!(identity, "desktop_chrome");
    }

    #[tokio::test]
    async fn age_gate_without_token_is_fatal() {
        let url = thread_url();
        let gated = "<html><body><p>var safeid appears in text only</p></body></html>";
        let transport = ScriptedTransport::new(vec![]);
        let mut session = Session::new(transport, BrowserIdentity::mobile_safari());
        let err = engine()
            .verify(&mut session, &url, page(&url, gated))
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::TokenExtraction));
        assert!(!err.retryable());
        assert_eq!(err.kind(), "token_extraction");
    }

    #[tokio::test]
    async fn bare_listing_short_circuits_without_fallback() {
        let url = Url::parse("https://example.com/forum.php").unwrap();
        let blocked = "<html><head><title>每日名言</title></head><body></body></html>";
        let transport = ScriptedTransport::new(vec![]);
        let mut session = Session::new(transport.clone(), BrowserIdentity::mobile_safari());
        let err = engine()
            .verify(&mut session, &url, page(&url, blocked))
            .await
            .unwrap_err();
        assert!(matches!(err, EvasionError::Intercepted { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn desktop_fallback_launders_then_reissues() {
        let url = thread_url();
        let blocked = "<html><head><title>每日名言</title></head><body></body></html>";
        let transport = ScriptedTransport::new(vec![
            page(&Url::parse("https://example.com/forum.php").unwrap(), "<html/>"),
            page(&url, HEALTHY),
        ]);
        let mut session = Session::new(transport.clone(), BrowserIdentity::mobile_safari());

        let result = engine().verify(&mut session, &url, page(&url, blocked)).await;
        assert!(result.is_ok());
        assert_eq!(transport.call_count(), 2);

        let (launder, identity, _) = transport.call(0);
        assert_eq!(launder.as_str(), "https://example.com/forum.php");
        assert_eq!(identity, "desktop_chrome");

        let (reissue, identity, _) = transport.call(1);
        assert_eq!(
            reissue.as_str(),
            "https://example.com/forum.php?mod=viewthread&tid=7"
        );
        assert_eq!(identity, "desktop_chrome");

        // The session's own identity is untouched.
        assert_eq!(session.identity().tag(), "mobile_safari");
    }

    #[tokio::test]
    async fn desktop_fallback_accepts_large_body_without_marker() {
        let url = thread_url();
        let blocked = "<html><head><title>每日名言</title></head><body></body></html>";
        let big_body = format!(
            "<html><head><title>nameless</title></head><body>{}</body></html>",
            "x".repeat(60_000)
        );
        let transport = ScriptedTransport::new(vec![
            page(&Url::parse("https://example.com/forum.php").unwrap(), "<html/>"),
            page(&url, &big_body),
        ]);
        let mut session = Session::new(transport, BrowserIdentity::mobile_safari());
        let result = engine().verify(&mut session, &url, page(&url, blocked)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn desktop_fallback_failure_is_interception() {
        let url = thread_url();
        let blocked = "<html><head><title>每日名言</title></head><body></body></html>";
        let transport = ScriptedTransport::new(vec![
            page(&Url::parse("https://example.com/forum.php").unwrap(), "<html/>"),
            page(&url, blocked),
        ]);
        let mut session = Session::new(transport, BrowserIdentity::mobile_safari());
        let err = engine()
            .verify(&mut session, &url, page(&url, blocked))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "content_interception");
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn interstitial_without_solver_fails() {
        let url = thread_url();
        let challenge =
            "<html><head><title>Just a moment...</title></head><body></body></html>";
        let transport = ScriptedTransport::new(vec![]);
        let mut session = Session::new(transport, BrowserIdentity::mobile_safari());
        let err = engine()
            .verify(&mut session, &url, page(&url, challenge))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvasionError::Bypass(SolverError::Unconfigured)
        ));
        assert_eq!(err.kind(), "challenge_verification");
    }
}
