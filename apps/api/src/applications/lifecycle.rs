//! Application lifecycle: creation guards and state transitions.
//!
//! Every status change goes through one of the `mark_*` functions below.
//! Each is a single conditional UPDATE that names the prior state it
//! expects, so two actors can never advance the same record twice: the
//! second writer matches zero rows and backs off.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::applications::quota::{self, QuotaSnapshot};
use crate::applications::target::validate_target;
use crate::config::Config;
use crate::errors::AppError;
use crate::models::application::{ApplicationStatus, ApplyMethod, AutoApplicationRow};
use crate::models::job::AggregatedJobRow;
use crate::models::profile::{ApplicationData, ProfilePayload};

// ─────────────────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a submit request.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CreateOutcome {
    Created {
        application: AutoApplicationRow,
        quota: QuotaSnapshot,
    },
    /// The (user, job) pair already has a record; callers get it back
    /// instead of an error.
    Existing(AutoApplicationRow),
}

/// Creates a new application in QUEUED after running every admission guard.
///
/// The duplicate check runs before every other guard: a re-submit returns
/// the existing record even when the job has since been deactivated, the
/// user is out of quota, or the profile has broken.
pub async fn create_application(
    pool: &PgPool,
    cfg: &Config,
    user_id: Uuid,
    job_id: Uuid,
) -> Result<CreateOutcome, AppError> {
    // 1. One record per (user, job). This lookup needs no job row, and a
    //    repeat submit must resolve even when the posting is gone.
    if let Some(existing) = fetch_by_user_and_job(pool, user_id, job_id).await? {
        return Ok(CreateOutcome::Existing(existing));
    }

    // 2. The job must exist, be live, and be flagged automatable.
    let job = fetch_job(pool, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id} not found")))?;
    if let Some(reason) = job_eligibility_error(&job) {
        return Err(AppError::Validation(reason.to_string()));
    }

    // 3. The apply URL must pass the trust check before any automation
    //    will ever touch it.
    let verdict = validate_target(&job.apply_url);
    if !verdict.valid {
        return Err(AppError::InvalidTarget(
            verdict
                .error
                .unwrap_or_else(|| "apply URL failed validation".to_string()),
        ));
    }

    // 4. The user needs a usable profile; legacy shapes are normalized here.
    let data = load_application_data(pool, user_id)
        .await?
        .ok_or_else(|| {
            AppError::Validation("No application profile on file for this user".to_string())
        })?;
    if !data.is_complete() {
        return Err(AppError::Validation(
            "Application profile is incomplete: full name and email are required".to_string(),
        ));
    }

    // 5. Daily quota, counted over non-cancelled records since midnight UTC.
    let quota = quota::check_daily_quota(pool, user_id, cfg.daily_application_limit).await?;
    if !quota.allowed {
        return Err(AppError::QuotaExceeded(quota));
    }

    // 6. Insert. The unique constraint is the last line of defense against
    //    a concurrent submit that slipped past step 1.
    let inserted = sqlx::query_as::<_, AutoApplicationRow>(
        r#"
        INSERT INTO auto_applications (user_id, job_id, status, max_retries)
        VALUES ($1, $2, 'QUEUED', $3)
        ON CONFLICT (user_id, job_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(job_id)
    .bind(cfg.default_max_retries)
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(application) => {
            let quota = quota::evaluate_quota(
                quota.used + 1,
                cfg.daily_application_limit,
                chrono::Utc::now(),
            );
            Ok(CreateOutcome::Created { application, quota })
        }
        None => {
            // Lost the race; hand back whichever record won.
            let existing = fetch_by_user_and_job(pool, user_id, job_id)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "insert conflicted but no existing application found for user {user_id} job {job_id}"
                    ))
                })?;
            Ok(CreateOutcome::Existing(existing))
        }
    }
}

/// Returns the rejection reason for a job that must not be auto-applied,
/// or `None` when the job is eligible.
pub fn job_eligibility_error(job: &AggregatedJobRow) -> Option<&'static str> {
    if !job.is_active {
        return Some("Job posting is no longer active");
    }
    if !job.ai_applyable {
        return Some("Job is not eligible for automated application");
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookups
// ─────────────────────────────────────────────────────────────────────────────

pub async fn fetch_job(pool: &PgPool, job_id: Uuid) -> Result<Option<AggregatedJobRow>, sqlx::Error> {
    sqlx::query_as::<_, AggregatedJobRow>("SELECT * FROM aggregated_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_application(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<AutoApplicationRow>, sqlx::Error> {
    sqlx::query_as::<_, AutoApplicationRow>("SELECT * FROM auto_applications WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn fetch_user_application(
    pool: &PgPool,
    user_id: Uuid,
    id: Uuid,
) -> Result<Option<AutoApplicationRow>, sqlx::Error> {
    sqlx::query_as::<_, AutoApplicationRow>(
        "SELECT * FROM auto_applications WHERE id = $1 AND user_id = $2",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

async fn fetch_by_user_and_job(
    pool: &PgPool,
    user_id: Uuid,
    job_id: Uuid,
) -> Result<Option<AutoApplicationRow>, sqlx::Error> {
    sqlx::query_as::<_, AutoApplicationRow>(
        "SELECT * FROM auto_applications WHERE user_id = $1 AND job_id = $2",
    )
    .bind(user_id)
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Loads the user's profile and normalizes legacy shapes into the canonical
/// application-data struct. Everything downstream of this point consumes the
/// canonical shape only.
pub async fn load_application_data(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<ApplicationData>, AppError> {
    let payload: Option<Value> =
        sqlx::query_scalar("SELECT payload FROM user_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;

    let Some(payload) = payload else {
        return Ok(None);
    };

    let parsed: ProfilePayload = serde_json::from_value(payload).map_err(|e| {
        AppError::Validation(format!("Stored profile payload is malformed: {e}"))
    })?;
    Ok(Some(parsed.normalize()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Transitions
// ─────────────────────────────────────────────────────────────────────────────

/// QUEUED|RETRYING → APPLYING. Returns false when the record was already
/// taken past that point (cancelled, or claimed by another executor).
pub async fn mark_applying(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auto_applications
        SET status = 'APPLYING', started_at = COALESCE(started_at, NOW())
        WHERE id = $1 AND status IN ('QUEUED', 'RETRYING')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Records one failed automation attempt while the record is APPLYING.
/// Returns the new (retry_count, max_retries) pair, or `None` when the
/// record is no longer APPLYING.
pub async fn record_attempt_failure(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    error_type: &str,
) -> Result<Option<(i32, i32)>, sqlx::Error> {
    sqlx::query_as::<_, (i32, i32)>(
        r#"
        UPDATE auto_applications
        SET retry_count = retry_count + 1, error = $2, error_type = $3
        WHERE id = $1 AND status = 'APPLYING'
        RETURNING retry_count, max_retries
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(error_type)
    .fetch_optional(pool)
    .await
}

/// APPLYING → RETRYING. The dispatcher picks the record up again.
pub async fn mark_retrying(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE auto_applications SET status = 'RETRYING' WHERE id = $1 AND status = 'APPLYING'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// APPLYING → MANUAL_REQUIRED. Used both for the too-complex short circuit
/// (pass a reason) and for retry exhaustion (pass `None`, the last failure
/// is already recorded on the row).
pub async fn mark_manual_required(
    pool: &PgPool,
    id: Uuid,
    reason: Option<&str>,
    error_type: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auto_applications
        SET status = 'MANUAL_REQUIRED',
            error = COALESCE($2, error),
            error_type = COALESCE($3, error_type)
        WHERE id = $1 AND status = 'APPLYING'
        "#,
    )
    .bind(id)
    .bind(reason)
    .bind(error_type)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// APPLYING|MANUAL_REQUIRED → SUBMITTED. Clears any stale error, stamps the
/// confirmation evidence, and adds this attempt's spend to the running cost.
pub async fn mark_submitted(
    pool: &PgPool,
    id: Uuid,
    method: ApplyMethod,
    confirmation_url: Option<&str>,
    confirmation_id: Option<&str>,
    confirmation_data: Option<&Value>,
    cost_delta: f64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auto_applications
        SET status = 'SUBMITTED',
            method = $2,
            submitted_at = NOW(),
            completed_at = NOW(),
            confirmation_url = $3,
            confirmation_id = $4,
            confirmation_data = $5,
            cost = cost + $6,
            error = NULL,
            error_type = NULL
        WHERE id = $1 AND status IN ('APPLYING', 'MANUAL_REQUIRED')
        "#,
    )
    .bind(id)
    .bind(method)
    .bind(confirmation_url)
    .bind(confirmation_id)
    .bind(confirmation_data)
    .bind(cost_delta)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// APPLYING|MANUAL_REQUIRED → FAILED. The stored error should carry the
/// original apply URL when known, so the user can finish by hand.
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    error: &str,
    error_type: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auto_applications
        SET status = 'FAILED', error = $2, error_type = $3, completed_at = NOW()
        WHERE id = $1 AND status IN ('APPLYING', 'MANUAL_REQUIRED')
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(error_type)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// FAILED → MANUAL_REQUIRED. Admin override that puts a dead application
/// back on the worker-assisted path.
pub async fn reopen_for_manual(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE auto_applications
        SET status = 'MANUAL_REQUIRED', completed_at = NULL
        WHERE id = $1 AND status = 'FAILED'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// User-initiated cancellation, honored only while still QUEUED.
pub async fn cancel_application(
    pool: &PgPool,
    user_id: Uuid,
    id: Uuid,
) -> Result<AutoApplicationRow, AppError> {
    let cancelled = sqlx::query_as::<_, AutoApplicationRow>(
        r#"
        UPDATE auto_applications
        SET status = 'CANCELLED', completed_at = NOW()
        WHERE id = $1 AND user_id = $2 AND status = 'QUEUED'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = cancelled {
        return Ok(row);
    }

    // Zero rows: either the record does not exist for this user, or it
    // has already advanced. Name the current status in the rejection.
    match fetch_user_application(pool, user_id, id).await? {
        None => Err(AppError::NotFound(format!("Application {id} not found"))),
        Some(row) => Err(AppError::Conflict(cancel_rejection(row.status))),
    }
}

/// Rejection message for a cancel attempt against a non-QUEUED record.
pub fn cancel_rejection(status: ApplicationStatus) -> String {
    format!("Cannot cancel an application in status {status}; only QUEUED applications can be cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(active: bool, applyable: bool) -> AggregatedJobRow {
        AggregatedJobRow {
            id: Uuid::new_v4(),
            apply_url: "https://boards.greenhouse.io/acme/jobs/123".to_string(),
            ats_type: "GREENHOUSE".to_string(),
            ats_complexity: "SIMPLE".to_string(),
            ai_applyable: applyable,
            is_active: active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_eligible_job_passes() {
        assert_eq!(job_eligibility_error(&job(true, true)), None);
    }

    #[test]
    fn test_inactive_job_is_rejected() {
        let reason = job_eligibility_error(&job(false, true)).unwrap();
        assert!(reason.contains("no longer active"));
    }

    #[test]
    fn test_non_applyable_job_is_rejected() {
        let reason = job_eligibility_error(&job(true, false)).unwrap();
        assert!(reason.contains("not eligible"));
    }

    #[test]
    fn test_inactive_wins_over_non_applyable() {
        // Both flags bad: report the stronger fact (posting is gone).
        let reason = job_eligibility_error(&job(false, false)).unwrap();
        assert!(reason.contains("no longer active"));
    }

    #[test]
    fn test_cancel_rejection_names_current_status() {
        let msg = cancel_rejection(ApplicationStatus::Applying);
        assert!(msg.contains("APPLYING"));
        assert!(msg.contains("QUEUED"));

        let msg = cancel_rejection(ApplicationStatus::Submitted);
        assert!(msg.contains("SUBMITTED"));
    }

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            redis_url: None,
            browser_server_url: "http://127.0.0.1:9102".to_string(),
            captcha_api_url: "http://127.0.0.1:9103".to_string(),
            captcha_api_key: "test-key".to_string(),
            mailbox_server_url: "http://127.0.0.1:9104".to_string(),
            port: 0,
            rust_log: "info".to_string(),
            daily_application_limit: 10,
            default_max_retries: 3,
            queue_concurrency: 1,
            recipe_retirement_floor: 0.5,
            recipe_min_sample: 3,
            recipe_stats_window: 0,
            recording_cost: 0.80,
            replay_cost: 0.05,
            captcha_low_balance_threshold: 2.0,
            platform_cache_capacity: 16,
        }
    }

    /// Needs a running PostgreSQL pointed to by DATABASE_URL.
    /// Run with: cargo test test_resubmit_survives_job_deactivation -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_resubmit_survives_job_deactivation() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::db::create_pool(&url).await.expect("pool + migrations");
        let cfg = test_config();

        let user_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO aggregated_jobs (id, apply_url, ats_type, ai_applyable, is_active)
            VALUES ($1, $2, 'GREENHOUSE', TRUE, TRUE)
            "#,
        )
        .bind(job_id)
        .bind("https://boards.greenhouse.io/acme/jobs/77")
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO user_profiles (user_id, payload) VALUES ($1, $2)")
            .bind(user_id)
            .bind(serde_json::json!({
                "personal_info": {"full_name": "Ada Tester", "email": "ada@example.com"}
            }))
            .execute(&pool)
            .await
            .unwrap();

        let first = create_application(&pool, &cfg, user_id, job_id).await.unwrap();
        let CreateOutcome::Created { application, .. } = first else {
            panic!("expected a fresh record");
        };

        sqlx::query("UPDATE aggregated_jobs SET is_active = FALSE WHERE id = $1")
            .bind(job_id)
            .execute(&pool)
            .await
            .unwrap();

        // The pair is already on file; the dead posting must not turn the
        // re-submit into an error.
        let second = create_application(&pool, &cfg, user_id, job_id).await.unwrap();
        let CreateOutcome::Existing(found) = second else {
            panic!("expected the stored record back");
        };
        assert_eq!(found.id, application.id);
    }
}
