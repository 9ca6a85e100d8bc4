//! Mailbox verification client.
//!
//! Some ATS platforms submit without returning any confirmation artifact.
//! When that happens the engine searches a monitored mailbox for a
//! confirmation email from the platform's domain and backfills the
//! application's confirmation data from the first match.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;
use url::Url;

const SEARCH_TIMEOUT_SECS: u64 = 30;
const SEARCH_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mailbox service returned status {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailMatch {
    pub subject: String,
    pub from: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<MailMatch>,
}

#[derive(Clone)]
pub struct MailboxClient {
    base_url: String,
    client: Client,
}

impl MailboxClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(SEARCH_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Recent messages whose sender matches the given domain. Read-only,
    /// so transient failures are retried with backoff.
    pub async fn search_recent(
        &self,
        sender_domain: &str,
        within_minutes: u32,
    ) -> Result<Vec<MailMatch>, MailboxError> {
        let mut last_error: Option<MailboxError> = None;

        for attempt in 0..SEARCH_RETRIES {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(500 * (1 << (attempt - 1)));
                warn!(
                    "Mailbox search attempt {} failed, retrying after {}ms",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .get(format!("{}/search", self.base_url))
                .query(&[
                    ("sender_domain", sender_domain),
                    ("within_minutes", &within_minutes.to_string()),
                ])
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(MailboxError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let message = response.text().await.unwrap_or_default();
                last_error = Some(MailboxError::Api {
                    status: status.as_u16(),
                    message,
                });
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(MailboxError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: SearchResponse = response.json().await?;
            return Ok(body.matches);
        }

        Err(last_error.unwrap_or(MailboxError::Api {
            status: 0,
            message: "search exhausted retries".to_string(),
        }))
    }
}

/// Registrable domain to search confirmation mail for, derived from the
/// apply URL host. `boards.greenhouse.io` → `greenhouse.io`; bare or
/// unparseable hosts yield `None` and the backfill is skipped.
pub fn sender_domain_for(apply_url: &str) -> Option<String> {
    let url = Url::parse(apply_url).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    Some(labels[labels.len() - 2..].join("."))
}

/// Confirmation payload built from the first (most relevant) match.
pub fn confirmation_from(matches: &[MailMatch]) -> Option<Value> {
    matches.first().map(|m| {
        json!({
            "source": "mailbox",
            "subject": m.subject,
            "from": m.from,
            "received_at": m.received_at,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mail(subject: &str) -> MailMatch {
        MailMatch {
            subject: subject.to_string(),
            from: "no-reply@greenhouse.io".to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap(),
            snippet: None,
        }
    }

    #[test]
    fn test_sender_domain_strips_subdomains() {
        assert_eq!(
            sender_domain_for("https://boards.greenhouse.io/acme/jobs/1").as_deref(),
            Some("greenhouse.io")
        );
        assert_eq!(
            sender_domain_for("https://acme.wd5.myworkdayjobs.com/jobs").as_deref(),
            Some("myworkdayjobs.com")
        );
        assert_eq!(
            sender_domain_for("https://workable.com/j/1").as_deref(),
            Some("workable.com")
        );
    }

    #[test]
    fn test_sender_domain_rejects_unusable_hosts() {
        assert_eq!(sender_domain_for("not a url"), None);
        assert_eq!(sender_domain_for("https://localhost/x"), None);
    }

    #[test]
    fn test_confirmation_uses_first_match() {
        let payload = confirmation_from(&[mail("Application received"), mail("Other")]).unwrap();
        assert_eq!(payload["source"], "mailbox");
        assert_eq!(payload["subject"], "Application received");
    }

    #[test]
    fn test_no_matches_no_confirmation() {
        assert!(confirmation_from(&[]).is_none());
    }
}
