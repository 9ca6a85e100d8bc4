use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of one auto-application.
///
/// QUEUED → APPLYING → SUBMITTED is the success path. APPLYING → RETRYING
/// loops back through dispatch until `max_retries` is exhausted. CANCELLED
/// is reachable only from QUEUED. MANUAL_REQUIRED is where the executor
/// parks applications whose ATS is classified too complex for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "application_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Queued,
    Applying,
    Retrying,
    Submitted,
    Failed,
    Cancelled,
    ManualRequired,
}

impl ApplicationStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Submitted
                | ApplicationStatus::Failed
                | ApplicationStatus::Cancelled
                | ApplicationStatus::ManualRequired
        )
    }

    /// Cancellation is only honored before execution begins.
    pub fn can_cancel(&self) -> bool {
        matches!(self, ApplicationStatus::Queued)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Queued => "QUEUED",
            ApplicationStatus::Applying => "APPLYING",
            ApplicationStatus::Retrying => "RETRYING",
            ApplicationStatus::Submitted => "SUBMITTED",
            ApplicationStatus::Failed => "FAILED",
            ApplicationStatus::Cancelled => "CANCELLED",
            ApplicationStatus::ManualRequired => "MANUAL_REQUIRED",
        }
    }
}

impl std::fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the submission was ultimately performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "apply_method", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyMethod {
    AiAuto,
    WorkerSubmit,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutoApplicationRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub status: ApplicationStatus,
    pub method: Option<ApplyMethod>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmation_url: Option<String>,
    pub confirmation_id: Option<String>,
    pub confirmation_data: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ApplicationStatus::Submitted.is_terminal());
        assert!(ApplicationStatus::Failed.is_terminal());
        assert!(ApplicationStatus::Cancelled.is_terminal());
        assert!(ApplicationStatus::ManualRequired.is_terminal());
        assert!(!ApplicationStatus::Queued.is_terminal());
        assert!(!ApplicationStatus::Applying.is_terminal());
        assert!(!ApplicationStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_only_queued_is_cancellable() {
        assert!(ApplicationStatus::Queued.can_cancel());
        assert!(!ApplicationStatus::Applying.can_cancel());
        assert!(!ApplicationStatus::Retrying.can_cancel());
        assert!(!ApplicationStatus::Submitted.can_cancel());
    }

    #[test]
    fn test_status_wire_format_is_screaming_snake() {
        let json = serde_json::to_string(&ApplicationStatus::ManualRequired).unwrap();
        assert_eq!(json, "\"MANUAL_REQUIRED\"");
        let back: ApplicationStatus = serde_json::from_str("\"RETRYING\"").unwrap();
        assert_eq!(back, ApplicationStatus::Retrying);
    }

    #[test]
    fn test_method_wire_format() {
        assert_eq!(
            serde_json::to_string(&ApplyMethod::WorkerSubmit).unwrap(),
            "\"WORKER_SUBMIT\""
        );
        assert_eq!(
            serde_json::to_string(&ApplyMethod::AiAuto).unwrap(),
            "\"AI_AUTO\""
        );
    }
}
