//! Best-effort operator notifications.
//!
//! The circuit breaker emits one alert when it trips. Delivery is fire and
//! forget: a failed notification is logged at debug level and never blocks
//! or fails the crawl.

use std::sync::Arc;

use serde::Serialize;

/// Alert payload rendered when the breaker trips.
#[derive(Debug, Clone, Serialize)]
pub struct StopAlert {
    pub error_kind: String,
    pub count: usize,
    pub details: String,
    pub suggestion: String,
    pub raised_at: chrono::DateTime<chrono::Utc>,
}

impl StopAlert {
    pub fn new(error_kind: impl Into<String>, count: usize, threshold: usize) -> Self {
        Self {
            error_kind: error_kind.into(),
            count,
            details: format!("error kind reached the stop threshold ({threshold} occurrences)"),
            suggestion: "check network connectivity and target site status".to_string(),
            raised_at: chrono::Utc::now(),
        }
    }

    /// Human-readable rendering used for plain-text channels and logs.
    pub fn render(&self) -> String {
        format!(
            "crawler stopped: error kind '{}' occurred {} times. {}. {}",
            self.error_kind, self.count, self.details, self.suggestion
        )
    }
}

/// Fire-and-forget alert sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &StopAlert);
}

/// Default sink: drop alerts silently.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _alert: &StopAlert) {}
}

/// Posts the alert as JSON to a webhook endpoint. Errors are swallowed; the
/// send happens on a detached task so the caller never waits on delivery.
pub struct WebhookNotifier {
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, alert: &StopAlert) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let payload = alert.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&endpoint).json(&payload).send().await {
                log::debug!("stop notification failed: {err}");
            }
        });
    }
}

/// Build the configured notifier, falling back to the no-op sink.
pub fn from_config(notify_url: Option<&str>) -> Arc<dyn Notifier> {
    match notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(NoopNotifier),
    }
}
