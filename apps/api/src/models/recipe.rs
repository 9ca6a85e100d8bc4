use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Whether an execution replayed a cached recipe or ran the full AI-driven
/// recording pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "recipe_method", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecipeMethod {
    Replay,
    Recording,
}

/// A cached automation script for one ATS platform.
///
/// `steps` is opaque to this service: an ordered action sequence the browser
/// driver discovered during a recording pass and can replay verbatim.
/// Statistics columns are only ever touched with atomic SQL increments so
/// concurrent executions against the same platform never lose updates.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApplicationRecipeRow {
    pub id: Uuid,
    pub platform: String,
    pub ats_type: String,
    pub version: i32,
    pub steps: Value,
    pub times_used: i32,
    pub failure_count: i32,
    pub success_rate: f64,
    pub recording_cost: f64,
    pub replay_cost: f64,
    pub total_saved: f64,
    pub recorded_by: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only log entry for one execution attempt. Never updated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecipeExecutionRow {
    pub id: Uuid,
    pub recipe_id: Option<Uuid>,
    pub success: bool,
    pub method: RecipeMethod,
    pub duration_ms: i64,
    pub cost: f64,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub job_url: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_wire_format() {
        assert_eq!(
            serde_json::to_string(&RecipeMethod::Replay).unwrap(),
            "\"REPLAY\""
        );
        assert_eq!(
            serde_json::to_string(&RecipeMethod::Recording).unwrap(),
            "\"RECORDING\""
        );
    }
}
