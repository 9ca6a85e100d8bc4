use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A job posting produced by the external aggregation pipeline.
/// This service only ever reads these rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AggregatedJobRow {
    pub id: Uuid,
    pub apply_url: String,
    pub ats_type: String,
    pub ats_complexity: String,
    pub ai_applyable: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl AggregatedJobRow {
    /// ATS instances the aggregation pipeline has marked beyond what the
    /// automation driver can handle. These go straight to MANUAL_REQUIRED.
    pub fn is_too_complex(&self) -> bool {
        self.ats_complexity.eq_ignore_ascii_case("COMPLEX")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(complexity: &str) -> AggregatedJobRow {
        AggregatedJobRow {
            id: Uuid::new_v4(),
            apply_url: "https://boards.greenhouse.io/acme/jobs/123".to_string(),
            ats_type: "GREENHOUSE".to_string(),
            ats_complexity: complexity.to_string(),
            ai_applyable: true,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_complex_flag() {
        assert!(job("COMPLEX").is_too_complex());
        assert!(job("complex").is_too_complex());
        assert!(!job("SIMPLE").is_too_complex());
        assert!(!job("MEDIUM").is_too_complex());
    }
}
