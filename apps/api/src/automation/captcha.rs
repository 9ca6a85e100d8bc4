//! CAPTCHA solver client.
//!
//! `solve` spends credits and is called at most once per automation attempt;
//! it is never auto-retried. `balance` is a free read used by the health
//! endpoint, so it retries with backoff like any idempotent probe.

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::automation::CaptchaChallenge;

/// Solver services routinely take a minute on hard challenges.
const SOLVE_TIMEOUT_SECS: u64 = 120;
const BALANCE_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("captcha service returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("captcha could not be solved: {0}")]
    Unsolved(String),
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: f64,
}

#[derive(Clone)]
pub struct CaptchaClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl CaptchaClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(SOLVE_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Submits a challenge and waits for the token. One shot: a failed
    /// solve surfaces to the executor, which decides retry vs escalation.
    pub async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
        let response = self
            .client
            .post(format!("{}/solve", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(challenge)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CaptchaError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: SolveResponse = response.json().await?;
        match body.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(CaptchaError::Unsolved(
                body.error.unwrap_or_else(|| "no token returned".to_string()),
            )),
        }
    }

    /// Remaining solver credits. Retries transient failures with
    /// exponential backoff since the read has no side effects.
    pub async fn balance(&self) -> Result<f64, CaptchaError> {
        let mut last_error: Option<CaptchaError> = None;

        for attempt in 0..BALANCE_RETRIES {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(500 * (1 << (attempt - 1)));
                warn!(
                    "Captcha balance check attempt {} failed, retrying after {}ms",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .get(format!("{}/balance", self.base_url))
                .header("x-api-key", &self.api_key)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(CaptchaError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let message = response.text().await.unwrap_or_default();
                last_error = Some(CaptchaError::Api {
                    status: status.as_u16(),
                    message,
                });
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(CaptchaError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: BalanceResponse = response.json().await?;
            return Ok(body.balance);
        }

        Err(last_error.unwrap_or(CaptchaError::Unsolved(
            "balance check exhausted retries".to_string(),
        )))
    }
}

/// Low-balance predicate for the health endpoint's critical alert.
pub fn balance_is_low(balance: f64, threshold: f64) -> bool {
    balance < threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_is_low_is_strictly_below() {
        assert!(balance_is_low(1.99, 2.0));
        assert!(!balance_is_low(2.0, 2.0));
        assert!(!balance_is_low(10.0, 2.0));
    }

    #[test]
    fn test_solve_response_with_token() {
        let body: SolveResponse = serde_json::from_str(r#"{"token": "tok-123"}"#).unwrap();
        assert_eq!(body.token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_solve_response_with_error_only() {
        let body: SolveResponse =
            serde_json::from_str(r#"{"token": null, "error": "unsolvable"}"#).unwrap();
        assert!(body.token.is_none());
        assert_eq!(body.error.as_deref(), Some("unsolvable"));
    }
}
