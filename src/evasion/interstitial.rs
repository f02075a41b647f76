//! Client for the external verification-solving service.
//!
//! The service accepts a JSON command describing the blocked request (URL,
//! proxy, current cookies) and replies with the solved page. Only the
//! challenge-bypass branch of the evasion engine talks to it.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Margin added on top of the solve budget for the client-side request
/// ceiling, covering transfer and queueing at the solver.
const SOLVE_CEILING_MARGIN: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no verification solver endpoint configured")]
    Unconfigured,
    #[error("solver request failed: {0}")]
    Transport(String),
    #[error("solver returned malformed payload: {0}")]
    Protocol(String),
    #[error("solver could not solve the challenge (status {0})")]
    Rejected(u16),
    #[error("page still gated after {0} bypass rounds")]
    StillGated(u32),
}

#[derive(Serialize)]
struct ProxyEntry<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct CookieEntry<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct SolveRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<ProxyEntry<'a>>,
    cookies: Vec<CookieEntry<'a>>,
}

#[derive(Deserialize)]
struct SolveResponse {
    solution: Solution,
}

#[derive(Deserialize)]
struct Solution {
    status: u16,
    response: String,
}

/// Thin client over the solver endpoint's JSON protocol.
pub struct SolverClient {
    endpoint: String,
    proxy: Option<String>,
    client: reqwest::Client,
    max_timeout_ms: u64,
    // Client-side ceiling on the solve request itself; a solver that accepts
    // and never answers must not stall the fetch forever.
    solve_ceiling: Duration,
}

impl SolverClient {
    pub fn new(endpoint: impl Into<String>, proxy: Option<String>) -> Self {
        let max_timeout_ms = 60_000;
        Self {
            endpoint: endpoint.into(),
            proxy,
            client: reqwest::Client::new(),
            max_timeout_ms,
            solve_ceiling: Duration::from_millis(max_timeout_ms) + SOLVE_CEILING_MARGIN,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_solve_ceiling(mut self, ceiling: Duration) -> Self {
        self.solve_ceiling = ceiling;
        self
    }

    /// Submit the blocked URL with the session's cookies and return the
    /// solved page HTML.
    pub async fn solve(
        &self,
        url: &Url,
        cookies: &HashMap<String, String>,
    ) -> Result<String, SolverError> {
        let payload = SolveRequest {
            cmd: "request.get",
            url: url.as_str(),
            max_timeout: self.max_timeout_ms,
            proxy: self.proxy.as_deref().map(|url| ProxyEntry { url }),
            cookies: cookies
                .iter()
                .map(|(name, value)| CookieEntry { name, value })
                .collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.solve_ceiling)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SolverError::Transport(format!(
                        "solver did not answer within {:?}",
                        self.solve_ceiling
                    ))
                } else {
                    SolverError::Transport(err.to_string())
                }
            })?;

        let parsed: SolveResponse = response
            .json()
            .await
            .map_err(|err| SolverError::Protocol(err.to_string()))?;

        if parsed.solution.status != 200 {
            return Err(SolverError::Rejected(parsed.solution.status));
        }
        Ok(parsed.solution.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_shape() {
        let mut cookies = HashMap::new();
        cookies.insert("_safe".to_string(), "token".to_string());
        let payload = SolveRequest {
            cmd: "request.get",
            url: "https://example.com/forum.php?mod=viewthread",
            max_timeout: 60_000,
            proxy: Some(ProxyEntry {
                url: "http://127.0.0.1:8080",
            }),
            cookies: cookies
                .iter()
                .map(|(name, value)| CookieEntry { name, value })
                .collect(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["cmd"], "request.get");
        assert_eq!(json["maxTimeout"], 60_000);
        assert_eq!(json["proxy"]["url"], "http://127.0.0.1:8080");
        assert_eq!(json["cookies"][0]["name"], "_safe");
    }

    #[test]
    fn response_payload_shape() {
        let raw = r#"{"solution": {"status": 200, "response": "<html></html>"}}"#;
        let parsed: SolveResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.solution.status, 200);
        assert_eq!(parsed.solution.response, "<html></html>");
    }

    #[tokio::test]
    async fn solve_returns_when_endpoint_stalls() {
        // Accept connections but never answer.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stall = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    held.push(socket);
                }
            }
        });

        let client = SolverClient::new(format!("http://{addr}/v1"), None)
            .with_solve_ceiling(Duration::from_millis(100));
        let url = Url::parse("https://example.com/forum.php?mod=viewthread&tid=1").unwrap();

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            client.solve(&url, &HashMap::new()),
        )
        .await;
        stall.abort();

        let err = outcome
            .expect("solve must fail on its own ceiling, not hang")
            .unwrap_err();
        assert!(matches!(err, SolverError::Transport(_)));
    }
}
