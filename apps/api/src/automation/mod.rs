//! Browser automation driver boundary.
//!
//! The engine never touches a browser directly; it talks to a sidecar
//! driver service (stealth browser + form-filling automation) over HTTP
//! and treats it as a swappable backend behind the `BrowserDriver` trait.
//! Replay, record, and prefill calls submit real forms, so they are never
//! auto-retried here; retry policy belongs to the application state
//! machine, which knows whether an attempt is safe to repeat.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::profile::ApplicationData;

pub mod captcha;
pub mod mailbox;

/// Browser calls cover page load, visual analysis, and form submission;
/// they are minutes-long in the worst case.
const DRIVE_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("driver returned status {status}: {message}")]
    Api { status: u16, message: String },
}

impl DriverError {
    /// Maps a transport-level failure onto the engine's error taxonomy.
    pub fn error_type(&self) -> &'static str {
        match self {
            DriverError::Http(e) if e.is_timeout() => "TIMEOUT",
            _ => "DRIVER_UNAVAILABLE",
        }
    }
}

/// Outcome of a replay or recording pass, as reported by the driver.
#[derive(Debug, Clone, Deserialize)]
pub struct DriveOutcome {
    pub status: DriveStatus,
    #[serde(default)]
    pub confirmation_url: Option<String>,
    #[serde(default)]
    pub confirmation_id: Option<String>,
    #[serde(default)]
    pub confirmation_data: Option<Value>,
    /// Step sequence discovered by a recording pass.
    #[serde(default)]
    pub steps: Option<Value>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Present when `status` is `captcha_required`.
    #[serde(default)]
    pub challenge: Option<CaptchaChallenge>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

impl DriveOutcome {
    /// Synthesized failure for conditions the driver cannot report itself,
    /// such as a challenge that stayed unsolved after a solver pass.
    pub fn failure(message: impl Into<String>, error_type: &str) -> Self {
        Self {
            status: DriveStatus::Failed,
            confirmation_url: None,
            confirmation_id: None,
            confirmation_data: None,
            steps: None,
            session_id: None,
            challenge: None,
            error: Some(message.into()),
            error_type: Some(error_type.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    Submitted,
    CaptchaRequired,
    Failed,
}

/// CAPTCHA challenge extracted from the page, forwarded verbatim to the
/// solver service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub provider: String,
    pub site_key: String,
    pub page_url: String,
}

/// Result of a prefill pass for worker-assisted submission. The browser
/// session is left open, parked on the filled form; `error` carries a
/// note when some fields could not be filled (the operator arbitrates).
#[derive(Debug, Clone, Deserialize)]
pub struct PrefillOutcome {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Executes a cached step sequence against the apply URL.
    async fn replay(
        &self,
        apply_url: &str,
        steps: &Value,
        applicant: &ApplicationData,
        captcha_token: Option<&str>,
    ) -> Result<DriveOutcome, DriverError>;

    /// Full AI-driven pass: analyze the page, derive a step sequence,
    /// execute it. The discovered steps come back in the outcome.
    async fn record(
        &self,
        apply_url: &str,
        applicant: &ApplicationData,
        captcha_token: Option<&str>,
    ) -> Result<DriveOutcome, DriverError>;

    /// Fills the form without submitting and parks the session for a
    /// human operator.
    async fn prefill(
        &self,
        apply_url: &str,
        applicant: &ApplicationData,
    ) -> Result<PrefillOutcome, DriverError>;

    /// Releases a parked browser session. Closing an already-closed
    /// session is not an error.
    async fn close_session(&self, session_id: &str) -> Result<(), DriverError>;
}

#[derive(Debug, Serialize)]
struct ReplayBody<'a> {
    url: &'a str,
    steps: &'a Value,
    applicant: &'a ApplicationData,
    #[serde(skip_serializing_if = "Option::is_none")]
    captcha_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    url: &'a str,
    applicant: &'a ApplicationData,
    #[serde(skip_serializing_if = "Option::is_none")]
    captcha_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PrefillBody<'a> {
    url: &'a str,
    applicant: &'a ApplicationData,
}

/// HTTP client for the sidecar driver service. Headless/proxy behavior is
/// the sidecar's own configuration; this client only needs its endpoint.
#[derive(Clone)]
pub struct HttpBrowserDriver {
    base_url: String,
    client: Client,
}

impl HttpBrowserDriver {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(DRIVE_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DriverError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DriverError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl BrowserDriver for HttpBrowserDriver {
    async fn replay(
        &self,
        apply_url: &str,
        steps: &Value,
        applicant: &ApplicationData,
        captcha_token: Option<&str>,
    ) -> Result<DriveOutcome, DriverError> {
        debug!("Driver replay against {apply_url}");
        self.post_json(
            "/replay",
            &ReplayBody {
                url: apply_url,
                steps,
                applicant,
                captcha_token,
            },
        )
        .await
    }

    async fn record(
        &self,
        apply_url: &str,
        applicant: &ApplicationData,
        captcha_token: Option<&str>,
    ) -> Result<DriveOutcome, DriverError> {
        debug!("Driver recording pass against {apply_url}");
        self.post_json(
            "/record",
            &RecordBody {
                url: apply_url,
                applicant,
                captcha_token,
            },
        )
        .await
    }

    async fn prefill(
        &self,
        apply_url: &str,
        applicant: &ApplicationData,
    ) -> Result<PrefillOutcome, DriverError> {
        debug!("Driver prefill against {apply_url}");
        self.post_json(
            "/prefill",
            &PrefillBody {
                url: apply_url,
                applicant,
            },
        )
        .await
    }

    async fn close_session(&self, session_id: &str) -> Result<(), DriverError> {
        let url = format!("{}/sessions/{session_id}/close", self.base_url);
        let response = self.client.post(&url).send().await?;

        let status = response.status();
        // 404 means the session is already gone, which is what we wanted.
        if !status.is_success() && status.as_u16() != 404 {
            let message = response.text().await.unwrap_or_default();
            return Err(DriverError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submitted_outcome() {
        let outcome: DriveOutcome = serde_json::from_str(
            r##"{
                "status": "submitted",
                "confirmation_url": "https://boards.greenhouse.io/confirm/abc",
                "confirmation_id": "abc",
                "session_id": "sess-4",
                "steps": [{"action": "click", "selector": "#submit"}]
            }"##,
        )
        .unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some("sess-4"));
        assert_eq!(outcome.status, DriveStatus::Submitted);
        assert_eq!(outcome.confirmation_id.as_deref(), Some("abc"));
        assert!(outcome.steps.is_some());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_parse_captcha_outcome() {
        let outcome: DriveOutcome = serde_json::from_str(
            r#"{
                "status": "captcha_required",
                "session_id": "sess-9",
                "challenge": {
                    "provider": "recaptcha_v2",
                    "site_key": "6LdKey",
                    "page_url": "https://jobs.lever.co/acme/1/apply"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(outcome.status, DriveStatus::CaptchaRequired);
        let challenge = outcome.challenge.unwrap();
        assert_eq!(challenge.provider, "recaptcha_v2");
        assert_eq!(outcome.session_id.as_deref(), Some("sess-9"));
    }

    #[test]
    fn test_parse_failed_outcome() {
        let outcome: DriveOutcome = serde_json::from_str(
            r#"{"status": "failed", "error": "selector not found", "error_type": "REPLAY_MISMATCH"}"#,
        )
        .unwrap();
        assert_eq!(outcome.status, DriveStatus::Failed);
        assert_eq!(outcome.error_type.as_deref(), Some("REPLAY_MISMATCH"));
    }

    #[test]
    fn test_prefill_outcome_with_partial_fill_note() {
        let outcome: PrefillOutcome = serde_json::from_str(
            r#"{"session_id": "sess-1", "error": "could not fill salary field"}"#,
        )
        .unwrap();
        assert_eq!(outcome.session_id.as_deref(), Some("sess-1"));
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_replay_body_omits_absent_token() {
        let data = ApplicationData::default();
        let steps = serde_json::json!([]);
        let body = serde_json::to_value(ReplayBody {
            url: "https://example.com",
            steps: &steps,
            applicant: &data,
            captcha_token: None,
        })
        .unwrap();
        assert!(body.get("captcha_token").is_none());
    }
}
