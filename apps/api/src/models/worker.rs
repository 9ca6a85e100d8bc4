use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of one human-assisted submission session.
///
/// QUEUED → ASSIGNED (atomic claim) → AI_PROCESSING → READY_FOR_SUBMIT,
/// then exactly one of COMPLETED / FAILED / SKIPPED. A skip may instead
/// return the session to QUEUED for another operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "worker_session_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerSessionStatus {
    Queued,
    Assigned,
    AiProcessing,
    ReadyForSubmit,
    Completed,
    Failed,
    Skipped,
}

impl WorkerSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerSessionStatus::Completed
                | WorkerSessionStatus::Failed
                | WorkerSessionStatus::Skipped
        )
    }

    /// States in which the claiming operator may invoke complete/fail/skip.
    /// AI_PROCESSING is included so an operator can bail out of a pre-fill
    /// that is visibly stuck.
    pub fn worker_actionable(&self) -> bool {
        matches!(
            self,
            WorkerSessionStatus::Assigned
                | WorkerSessionStatus::AiProcessing
                | WorkerSessionStatus::ReadyForSubmit
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerSessionStatus::Queued => "QUEUED",
            WorkerSessionStatus::Assigned => "ASSIGNED",
            WorkerSessionStatus::AiProcessing => "AI_PROCESSING",
            WorkerSessionStatus::ReadyForSubmit => "READY_FOR_SUBMIT",
            WorkerSessionStatus::Completed => "COMPLETED",
            WorkerSessionStatus::Failed => "FAILED",
            WorkerSessionStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for WorkerSessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "worker_role", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRole {
    Operator,
    Admin,
}

/// A human operator account. Provisioned by an admin; counters are bumped
/// atomically by session terminal operations.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerRow {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: WorkerRole,
    pub is_active: bool,
    pub total_completed: i32,
    pub total_failed: i32,
    pub total_skipped: i32,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerSessionRow {
    pub id: Uuid,
    pub auto_application_id: Uuid,
    pub status: WorkerSessionStatus,
    pub worker_id: Option<Uuid>,
    pub automation_session_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_notes: Option<String>,
    pub fail_reason: Option<String>,
    pub skip_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(WorkerSessionStatus::Completed.is_terminal());
        assert!(WorkerSessionStatus::Failed.is_terminal());
        assert!(WorkerSessionStatus::Skipped.is_terminal());
        assert!(!WorkerSessionStatus::Queued.is_terminal());
        assert!(!WorkerSessionStatus::ReadyForSubmit.is_terminal());
    }

    #[test]
    fn test_worker_actionable_states() {
        assert!(WorkerSessionStatus::Assigned.worker_actionable());
        assert!(WorkerSessionStatus::AiProcessing.worker_actionable());
        assert!(WorkerSessionStatus::ReadyForSubmit.worker_actionable());
        assert!(!WorkerSessionStatus::Queued.worker_actionable());
        assert!(!WorkerSessionStatus::Completed.worker_actionable());
    }

    #[test]
    fn test_session_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&WorkerSessionStatus::ReadyForSubmit).unwrap(),
            "\"READY_FOR_SUBMIT\""
        );
        assert_eq!(
            serde_json::to_string(&WorkerSessionStatus::AiProcessing).unwrap(),
            "\"AI_PROCESSING\""
        );
    }

    #[test]
    fn test_password_hash_never_serialized() {
        let worker = WorkerRow {
            id: Uuid::new_v4(),
            email: "op@example.com".to_string(),
            password_hash: "$argon2id$v=19$secret".to_string(),
            name: "Op".to_string(),
            role: WorkerRole::Operator,
            is_active: true,
            total_completed: 0,
            total_failed: 0,
            total_skipped: 0,
            last_active_at: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&worker).unwrap();
        assert!(!json.contains("argon2id"));
        assert!(!json.contains("password_hash"));
    }
}
