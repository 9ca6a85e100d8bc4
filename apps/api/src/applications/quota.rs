use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::application::ApplicationStatus;

/// Result of a daily-quota check. Returned with every submit response so
/// clients can render remaining budget without a second call.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub allowed: bool,
    pub used: i64,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
}

/// Counts the user's non-cancelled applications since midnight UTC and
/// compares against the daily limit.
///
/// Read-only and idempotent. Storage errors propagate — a quota check that
/// cannot read history fails closed (the caller denies), it never falls
/// open to unlimited applications.
pub async fn check_daily_quota(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> Result<QuotaSnapshot, sqlx::Error> {
    let window_start = start_of_utc_day(Utc::now());

    let used: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM auto_applications
        WHERE user_id = $1 AND status <> $2 AND created_at >= $3
        "#,
    )
    .bind(user_id)
    .bind(ApplicationStatus::Cancelled)
    .bind(window_start)
    .fetch_one(pool)
    .await?;

    Ok(evaluate_quota(used, limit, Utc::now()))
}

/// Pure threshold check, separated from the count query for testability.
pub fn evaluate_quota(used: i64, limit: i64, now: DateTime<Utc>) -> QuotaSnapshot {
    QuotaSnapshot {
        allowed: used < limit,
        used,
        remaining: (limit - used).max(0),
        limit,
        reset_at: start_of_utc_day(now) + Duration::days(1),
    }
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, h, m, 0).unwrap()
    }

    #[test]
    fn test_under_limit_is_allowed() {
        let q = evaluate_quota(4, 10, at(12, 0));
        assert!(q.allowed);
        assert_eq!(q.used, 4);
        assert_eq!(q.remaining, 6);
        assert_eq!(q.limit, 10);
    }

    #[test]
    fn test_at_limit_is_denied() {
        let q = evaluate_quota(10, 10, at(12, 0));
        assert!(!q.allowed);
        assert_eq!(q.remaining, 0);
    }

    #[test]
    fn test_over_limit_clamps_remaining_to_zero() {
        // Can happen when the limit is lowered mid-day.
        let q = evaluate_quota(14, 10, at(12, 0));
        assert!(!q.allowed);
        assert_eq!(q.remaining, 0);
    }

    #[test]
    fn test_tenth_is_allowed_eleventh_is_not() {
        assert!(evaluate_quota(9, 10, at(12, 0)).allowed);
        assert!(!evaluate_quota(10, 10, at(12, 0)).allowed);
    }

    #[test]
    fn test_reset_at_is_next_midnight_utc() {
        let q = evaluate_quota(0, 10, at(0, 1));
        assert_eq!(
            q.reset_at,
            Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap()
        );
        // Same reset point from late in the day.
        let q = evaluate_quota(0, 10, at(23, 59));
        assert_eq!(
            q.reset_at,
            Utc.with_ymd_and_hms(2025, 6, 16, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_zero_limit_denies_everything() {
        let q = evaluate_quota(0, 0, at(12, 0));
        assert!(!q.allowed);
        assert_eq!(q.remaining, 0);
    }
}
