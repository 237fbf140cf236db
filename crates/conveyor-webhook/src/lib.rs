//! Blocking run-completion notification.
//!
//! The source's webhook client fired a background thread and logged
//! delivery failures without ever surfacing them to the caller. The
//! `notification` step has no such luxury: it is the last step in
//! [`conveyor_types::CANONICAL_STEPS`], and a run that cannot tell anyone
//! it finished is not a run that finished. `Notifier::notify` is therefore
//! synchronous and returns a `Result` — its `Err` is what the `notification`
//! step runner turns into `StepState::Failed`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use conveyor_retry::{BACKOFF_TABLE_SECONDS, DEFAULT_JITTER_FRACTION};
use conveyor_types::{RunStatus, StepName};

type HmacSha256 = Hmac<Sha256>;

/// Configuration for the shipped webhook notifier, shaped after the
/// source's `WebhookConfig` (`enabled`/`url`/`secret`/`timeout`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    #[serde(
        default = "default_timeout",
        serialize_with = "conveyor_duration::serialize_duration",
        deserialize_with = "conveyor_duration::deserialize_duration"
    )]
    pub timeout: Duration,
    /// Number of delivery attempts before the step fails, reusing the same
    /// fixed backoff table the step retry policy uses.
    #[serde(default = "default_delivery_attempts")]
    pub delivery_attempts: u32,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_delivery_attempts() -> u32 {
    3
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret: None,
            timeout: default_timeout(),
            delivery_attempts: default_delivery_attempts(),
        }
    }
}

/// A compact summary of a finished run, posted to the configured webhook.
/// Also staged to storage by the orchestrator and read back by the
/// `notification` step runner, hence `Deserialize` alongside `Serialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub current_step: Option<StepName>,
    pub warning_count: u32,
    pub runtime_ms: Option<u64>,
    pub error_message: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WebhookEvent<'a> {
    RunSucceeded { summary: &'a RunSummary },
    RunSucceededWithWarning { summary: &'a RunSummary },
    RunFailed { summary: &'a RunSummary },
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: WebhookEvent<'a>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook not configured")]
    NotConfigured,
    #[error("failed to build notification client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("notification delivery failed after {attempts} attempt(s): {source}")]
    Delivery {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("webhook endpoint returned non-success status {status}")]
    BadStatus { status: u16 },
    #[error("test double configured to fail")]
    TestDoubleFailure,
}

/// The seam the `notification` step runner depends on. Any
/// implementation must be synchronous: returning before the caller can
/// observe success or failure is what made the source's fire-and-forget
/// delivery unsuitable here.
pub trait Notifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError>;
}

/// Posts a signed JSON summary to a configured URL, retrying delivery up to
/// `config.delivery_attempts` times using the same backoff table the step
/// retry policy uses, then failing the step for good.
pub struct WebhookNotifier {
    client: reqwest::blocking::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(NotifyError::ClientBuild)?;
        Ok(Self { client, config })
    }

    fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.config.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    fn do_send(&self, url: &str, event: WebhookEvent<'_>) -> Result<(), reqwest::Error> {
        let payload = WebhookPayload {
            timestamp: Utc::now(),
            event,
        };
        let body = serde_json::to_vec(&payload).expect("WebhookPayload always serializes");

        let mut request = self.client.post(url).header("Content-Type", "application/json");
        if let Some(signature) = self.sign(&body) {
            request = request.header("X-Conveyor-Signature", format!("sha256={signature}"));
        }

        let response = request.body(body).send()?;
        response.error_for_status().map(|_| ())
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        if !self.config.enabled {
            return Ok(());
        }
        let url = self.config.url.as_deref().ok_or(NotifyError::NotConfigured)?;

        let event = match summary.status {
            RunStatus::Success => WebhookEvent::RunSucceeded { summary },
            RunStatus::SuccessWithWarning => WebhookEvent::RunSucceededWithWarning { summary },
            _ => WebhookEvent::RunFailed { summary },
        };

        let attempts = self.config.delivery_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.do_send(url, event_clone(&event)) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < attempts {
                        let base = BACKOFF_TABLE_SECONDS[0].min(5);
                        let delay = conveyor_retry::apply_jitter_seconds(base, DEFAULT_JITTER_FRACTION);
                        std::thread::sleep(Duration::from_secs(delay));
                    }
                }
            }
        }

        Err(NotifyError::Delivery {
            attempts,
            source: last_err.expect("loop runs at least once"),
        })
    }
}

fn event_clone<'a>(event: &WebhookEvent<'a>) -> WebhookEvent<'a> {
    match *event {
        WebhookEvent::RunSucceeded { summary } => WebhookEvent::RunSucceeded { summary },
        WebhookEvent::RunSucceededWithWarning { summary } => WebhookEvent::RunSucceededWithWarning { summary },
        WebhookEvent::RunFailed { summary } => WebhookEvent::RunFailed { summary },
    }
}

/// A no-op notifier for runs with no webhook configured, or for tests that
/// don't care about notification.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _summary: &RunSummary) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A test double that always fails, for exercising the `notification`
/// step's failure path without a real HTTP endpoint.
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, _summary: &RunSummary) -> Result<(), NotifyError> {
        Err(NotifyError::TestDoubleFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;

    fn sample_summary(status: RunStatus) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            status,
            current_step: Some(StepName::Notification),
            warning_count: 0,
            runtime_ms: Some(12_345),
            error_message: None,
            finished_at: Some(Utc::now()),
        }
    }

    #[test]
    fn null_notifier_always_succeeds() {
        assert!(NullNotifier.notify(&sample_summary(RunStatus::Success)).is_ok());
    }

    #[test]
    fn failing_notifier_always_fails() {
        assert!(FailingNotifier.notify(&sample_summary(RunStatus::Failed)).is_err());
    }

    #[test]
    fn disabled_config_is_a_no_op() {
        let config = WebhookConfig {
            enabled: false,
            url: Some("http://127.0.0.1:1/unreachable".into()),
            secret: None,
            timeout: Duration::from_millis(50),
            delivery_attempts: 1,
        };
        let notifier = WebhookNotifier::new(config).unwrap();
        assert!(notifier.notify(&sample_summary(RunStatus::Success)).is_ok());
    }

    #[test]
    fn enabled_without_url_is_not_configured() {
        let config = WebhookConfig {
            enabled: true,
            url: None,
            secret: None,
            timeout: Duration::from_millis(50),
            delivery_attempts: 1,
        };
        let notifier = WebhookNotifier::new(config).unwrap();
        let err = notifier.notify(&sample_summary(RunStatus::Success)).unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }

    #[test]
    fn successful_delivery_signs_the_body_and_returns_ok() {
        let (tx, rx) = mpsc::channel();
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().unwrap();
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let signature = request
                .headers()
                .iter()
                .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("X-Conveyor-Signature"))
                .map(|h| h.value.as_str().to_string());
            tx.send((body, signature)).unwrap();
            request.respond(tiny_http::Response::empty(200)).unwrap();
        });

        let config = WebhookConfig {
            enabled: true,
            url: Some(format!("http://{addr}/")),
            secret: Some("topsecret".into()),
            timeout: Duration::from_secs(5),
            delivery_attempts: 1,
        };
        let notifier = WebhookNotifier::new(config).unwrap();
        let result = notifier.notify(&sample_summary(RunStatus::SuccessWithWarning));
        handle.join().unwrap();

        assert!(result.is_ok());
        let (body, signature) = rx.recv().unwrap();
        assert!(body.contains("run_succeeded_with_warning"));
        assert!(signature.unwrap().starts_with("sha256="));
    }

    #[test]
    fn non_success_status_is_reported_as_delivery_failure() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            request.respond(tiny_http::Response::empty(500)).unwrap();
        });

        let config = WebhookConfig {
            enabled: true,
            url: Some(format!("http://{addr}/")),
            secret: None,
            timeout: Duration::from_secs(5),
            delivery_attempts: 1,
        };
        let notifier = WebhookNotifier::new(config).unwrap();
        let result = notifier.notify(&sample_summary(RunStatus::Failed));
        handle.join().unwrap();

        assert!(matches!(result, Err(NotifyError::Delivery { attempts: 1, .. })));
    }
}
