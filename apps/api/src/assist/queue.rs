//! Worker-assisted submission queue.
//!
//! Sessions are claimed optimistically: pick the oldest QUEUED candidate,
//! then try a single conditional update. Losing the race means another
//! operator got that session; the claim moves on to the next candidate a
//! bounded number of times before reporting a conflict. No lock is ever
//! held, and no two operators can hold the same session.
//!
//! Every terminal operation closes the parked automation session before
//! touching any status, so a failed write can never leak a live browser.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::applications::lifecycle;
use crate::errors::AppError;
use crate::events::StatusEvent;
use crate::models::application::{ApplicationStatus, ApplyMethod};
use crate::models::worker::{WorkerRow, WorkerSessionRow};
use crate::state::AppState;

/// How many QUEUED candidates a single claim call will race for before
/// telling the operator to try again.
const CLAIM_ATTEMPTS: usize = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Enqueue and listing
// ─────────────────────────────────────────────────────────────────────────────

/// Queues a session for an escalated application. Idempotent: the unique
/// constraint on the application id makes a second escalation a no-op.
pub async fn enqueue_session(pool: &PgPool, auto_application_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO worker_sessions (auto_application_id, status)
        VALUES ($1, 'QUEUED')
        ON CONFLICT (auto_application_id) DO NOTHING
        "#,
    )
    .bind(auto_application_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// A queue entry as operators see it: enough context to judge the job
/// before claiming.
#[derive(Debug, Serialize, FromRow)]
pub struct QueueEntry {
    pub id: Uuid,
    pub auto_application_id: Uuid,
    pub queued_at: DateTime<Utc>,
    pub apply_url: String,
    pub ats_type: String,
    pub error: Option<String>,
}

pub async fn list_queued(pool: &PgPool) -> Result<Vec<QueueEntry>, sqlx::Error> {
    sqlx::query_as::<_, QueueEntry>(
        r#"
        SELECT s.id, s.auto_application_id, s.queued_at, j.apply_url, j.ats_type, a.error
        FROM worker_sessions s
        JOIN auto_applications a ON a.id = s.auto_application_id
        JOIN aggregated_jobs j ON j.id = a.job_id
        WHERE s.status = 'QUEUED'
        ORDER BY s.queued_at ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Claim
// ─────────────────────────────────────────────────────────────────────────────

/// Atomically claims the oldest QUEUED session for the worker.
///
/// Exactly one concurrent caller wins any given session; losers advance to
/// the next candidate. An empty queue is NotFound, a queue that drained
/// under sustained racing is a claim conflict.
pub async fn claim_next(pool: &PgPool, worker_id: Uuid) -> Result<WorkerSessionRow, AppError> {
    let worker = fetch_worker(pool, worker_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Worker {worker_id} not found")))?;
    if !worker.is_active {
        return Err(AppError::Forbidden);
    }

    for _ in 0..CLAIM_ATTEMPTS {
        let candidate: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM worker_sessions WHERE status = 'QUEUED' ORDER BY queued_at ASC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let Some(candidate) = candidate else {
            return Err(AppError::NotFound("No sessions waiting in the queue".to_string()));
        };

        let claimed = sqlx::query_as::<_, WorkerSessionRow>(
            r#"
            UPDATE worker_sessions
            SET status = 'ASSIGNED', worker_id = $2, assigned_at = NOW()
            WHERE id = $1 AND status = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(candidate)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;

        if let Some(session) = claimed {
            sqlx::query("UPDATE workers SET last_active_at = NOW() WHERE id = $1")
                .bind(worker_id)
                .execute(pool)
                .await?;
            info!("Worker {worker_id} claimed session {}", session.id);
            return Ok(session);
        }
        // Someone else won this candidate; try the next one.
    }

    Err(AppError::ClaimConflict)
}

// ─────────────────────────────────────────────────────────────────────────────
// Pre-fill
// ─────────────────────────────────────────────────────────────────────────────

/// Kicks off the background pre-fill for a freshly claimed session. The
/// operator polls the session; it lands in READY_FOR_SUBMIT either way,
/// with notes describing anything automation could not fill.
pub fn spawn_prefill(state: AppState, session_id: Uuid) {
    tokio::spawn(async move {
        if let Err(e) = prefill(&state, session_id).await {
            warn!("Pre-fill for session {session_id} errored: {e:?}");
        }
    });
}

async fn prefill(state: &AppState, session_id: Uuid) -> anyhow::Result<()> {
    let db = &state.db;

    // Only an untouched ASSIGNED session gets a pre-fill pass.
    let started = sqlx::query(
        "UPDATE worker_sessions SET status = 'AI_PROCESSING' WHERE id = $1 AND status = 'ASSIGNED'",
    )
    .bind(session_id)
    .execute(db)
    .await?;
    if started.rows_affected() == 0 {
        return Ok(());
    }

    let context: Option<(Uuid, String)> = sqlx::query_as(
        r#"
        SELECT a.user_id, j.apply_url
        FROM worker_sessions s
        JOIN auto_applications a ON a.id = s.auto_application_id
        JOIN aggregated_jobs j ON j.id = a.job_id
        WHERE s.id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?;

    let Some((user_id, apply_url)) = context else {
        warn!("Session {session_id} has no joinable application/job context");
        return finish_prefill(db, session_id, None, Some("application context missing")).await;
    };

    let applicant = match lifecycle::load_application_data(db, user_id).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            return finish_prefill(db, session_id, None, Some("no profile on file; fill manually"))
                .await
        }
        Err(e) => {
            warn!("Profile load failed for session {session_id}: {e}");
            return finish_prefill(db, session_id, None, Some("profile unavailable; fill manually"))
                .await;
        }
    };

    match state.driver.prefill(&apply_url, &applicant).await {
        Ok(outcome) => {
            finish_prefill(
                db,
                session_id,
                outcome.session_id.as_deref(),
                outcome.error.as_deref(),
            )
            .await
        }
        Err(e) => {
            warn!("Automation pre-fill failed for session {session_id}: {e}");
            finish_prefill(
                db,
                session_id,
                None,
                Some("automation pre-fill failed; fill manually"),
            )
            .await
        }
    }
}

async fn finish_prefill(
    pool: &PgPool,
    session_id: Uuid,
    automation_session_id: Option<&str>,
    note: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE worker_sessions
        SET status = 'READY_FOR_SUBMIT', automation_session_id = $2, worker_notes = $3
        WHERE id = $1 AND status = 'AI_PROCESSING'
        "#,
    )
    .bind(session_id)
    .bind(automation_session_id)
    .bind(note)
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal operations
// ─────────────────────────────────────────────────────────────────────────────

/// Gate shared by complete/fail/skip: the caller must be the assigned
/// worker and the session must still be in an actionable state.
pub fn authorize_terminal(session: &WorkerSessionRow, worker_id: Uuid) -> Result<(), AppError> {
    if session.worker_id != Some(worker_id) {
        return Err(AppError::Forbidden);
    }
    if !session.status.worker_actionable() {
        return Err(AppError::Conflict(format!(
            "Session is {} and can no longer be acted on",
            session.status
        )));
    }
    Ok(())
}

/// Operator submitted the form by hand: session COMPLETED, parent
/// application SUBMITTED via WORKER_SUBMIT, completed counter bumped.
pub async fn complete_session(
    state: &AppState,
    session_id: Uuid,
    worker_id: Uuid,
    notes: Option<String>,
) -> Result<WorkerSessionRow, AppError> {
    let session = require_session(&state.db, session_id).await?;
    authorize_terminal(&session, worker_id)?;
    close_automation(state, &session).await;

    let updated = sqlx::query_as::<_, WorkerSessionRow>(
        r#"
        UPDATE worker_sessions
        SET status = 'COMPLETED', completed_at = NOW(),
            worker_notes = COALESCE($3, worker_notes)
        WHERE id = $1 AND worker_id = $2
          AND status IN ('ASSIGNED', 'AI_PROCESSING', 'READY_FOR_SUBMIT')
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(worker_id)
    .bind(notes)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::Conflict("Session advanced before completion was recorded".to_string()))?;

    let parent_updated = lifecycle::mark_submitted(
        &state.db,
        session.auto_application_id,
        ApplyMethod::WorkerSubmit,
        None,
        None,
        None,
        0.0,
    )
    .await?;
    if !parent_updated {
        warn!(
            "Application {} had already advanced at worker completion bookkeeping",
            session.auto_application_id
        );
    }
    bump_completed(&state.db, worker_id).await?;

    if parent_updated {
        state.hub.emit(
            session.auto_application_id,
            StatusEvent::Done {
                status: ApplicationStatus::Submitted,
            },
        );
    }
    info!(
        "Worker {worker_id} completed session {session_id} (application {})",
        session.auto_application_id
    );
    Ok(updated)
}

/// Operator could not submit: session FAILED, parent application FAILED
/// with the reason and the apply URL for manual completion.
pub async fn fail_session(
    state: &AppState,
    session_id: Uuid,
    worker_id: Uuid,
    reason: String,
) -> Result<WorkerSessionRow, AppError> {
    let session = require_session(&state.db, session_id).await?;
    authorize_terminal(&session, worker_id)?;
    close_automation(state, &session).await;

    let updated = sqlx::query_as::<_, WorkerSessionRow>(
        r#"
        UPDATE worker_sessions
        SET status = 'FAILED', completed_at = NOW(), fail_reason = $3
        WHERE id = $1 AND worker_id = $2
          AND status IN ('ASSIGNED', 'AI_PROCESSING', 'READY_FOR_SUBMIT')
        RETURNING *
        "#,
    )
    .bind(session_id)
    .bind(worker_id)
    .bind(&reason)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::Conflict("Session advanced before failure was recorded".to_string()))?;

    let error = match apply_url_for(&state.db, session.auto_application_id).await? {
        Some(url) => format!(
            "Worker-assisted submission failed: {reason}; you can complete this application manually at {url}"
        ),
        None => format!("Worker-assisted submission failed: {reason}"),
    };
    let parent_updated =
        lifecycle::mark_failed(&state.db, session.auto_application_id, &error, "WORKER_FAILED")
            .await?;
    if !parent_updated {
        warn!(
            "Application {} had already advanced at worker failure bookkeeping",
            session.auto_application_id
        );
    }
    bump_failed(&state.db, worker_id).await?;

    if parent_updated {
        state.hub.emit(
            session.auto_application_id,
            StatusEvent::Done {
                status: ApplicationStatus::Failed,
            },
        );
    }
    Ok(updated)
}

/// Operator passes on the session. `requeue` returns it to QUEUED with the
/// assignment cleared so another operator can take it; otherwise it is
/// skipped permanently and the parent application fails with the apply URL
/// so the user can finish by hand.
pub async fn skip_session(
    state: &AppState,
    session_id: Uuid,
    worker_id: Uuid,
    reason: Option<String>,
    requeue: bool,
) -> Result<WorkerSessionRow, AppError> {
    let session = require_session(&state.db, session_id).await?;
    authorize_terminal(&session, worker_id)?;
    close_automation(state, &session).await;

    let updated = if requeue {
        sqlx::query_as::<_, WorkerSessionRow>(
            r#"
            UPDATE worker_sessions
            SET status = 'QUEUED', worker_id = NULL, assigned_at = NULL,
                automation_session_id = NULL, skip_reason = $3
            WHERE id = $1 AND worker_id = $2
              AND status IN ('ASSIGNED', 'AI_PROCESSING', 'READY_FOR_SUBMIT')
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(worker_id)
        .bind(&reason)
        .fetch_optional(&state.db)
        .await?
    } else {
        sqlx::query_as::<_, WorkerSessionRow>(
            r#"
            UPDATE worker_sessions
            SET status = 'SKIPPED', completed_at = NOW(), skip_reason = $3
            WHERE id = $1 AND worker_id = $2
              AND status IN ('ASSIGNED', 'AI_PROCESSING', 'READY_FOR_SUBMIT')
            RETURNING *
            "#,
        )
        .bind(session_id)
        .bind(worker_id)
        .bind(&reason)
        .fetch_optional(&state.db)
        .await?
    }
    .ok_or_else(|| AppError::Conflict("Session advanced before skip was recorded".to_string()))?;

    if !requeue {
        let reason = reason.unwrap_or_else(|| "no operator could complete it".to_string());
        let error = match apply_url_for(&state.db, session.auto_application_id).await? {
            Some(url) => format!(
                "Worker-assisted submission was skipped: {reason}; you can complete this application manually at {url}"
            ),
            None => format!("Worker-assisted submission was skipped: {reason}"),
        };
        if lifecycle::mark_failed(&state.db, session.auto_application_id, &error, "WORKER_SKIPPED")
            .await?
        {
            state.hub.emit(
                session.auto_application_id,
                StatusEvent::Done {
                    status: ApplicationStatus::Failed,
                },
            );
        } else {
            warn!(
                "Application {} had already advanced at worker skip bookkeeping",
                session.auto_application_id
            );
        }
    }
    bump_skipped(&state.db, worker_id).await?;

    Ok(updated)
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

pub async fn fetch_worker(pool: &PgPool, worker_id: Uuid) -> Result<Option<WorkerRow>, sqlx::Error> {
    sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = $1")
        .bind(worker_id)
        .fetch_optional(pool)
        .await
}

pub async fn leaderboard(pool: &PgPool, limit: i64) -> Result<Vec<WorkerRow>, sqlx::Error> {
    sqlx::query_as::<_, WorkerRow>(
        r#"
        SELECT * FROM workers
        WHERE is_active = TRUE
        ORDER BY total_completed DESC, total_failed ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Internals
// ─────────────────────────────────────────────────────────────────────────────

async fn require_session(pool: &PgPool, session_id: Uuid) -> Result<WorkerSessionRow, AppError> {
    sqlx::query_as::<_, WorkerSessionRow>("SELECT * FROM worker_sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Session {session_id} not found")))
}

async fn close_automation(state: &AppState, session: &WorkerSessionRow) {
    if let Some(sid) = &session.automation_session_id {
        if let Err(e) = state.driver.close_session(sid).await {
            warn!("Failed to close automation session {sid}: {e}");
        }
    }
}

async fn apply_url_for(pool: &PgPool, application_id: Uuid) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT j.apply_url
        FROM auto_applications a
        JOIN aggregated_jobs j ON j.id = a.job_id
        WHERE a.id = $1
        "#,
    )
    .bind(application_id)
    .fetch_optional(pool)
    .await
}

async fn bump_completed(pool: &PgPool, worker_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE workers SET total_completed = total_completed + 1, last_active_at = NOW() WHERE id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn bump_failed(pool: &PgPool, worker_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE workers SET total_failed = total_failed + 1, last_active_at = NOW() WHERE id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn bump_skipped(pool: &PgPool, worker_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE workers SET total_skipped = total_skipped + 1, last_active_at = NOW() WHERE id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::automation::captcha::CaptchaClient;
    use crate::automation::mailbox::MailboxClient;
    use crate::automation::HttpBrowserDriver;
    use crate::cache::BoundedCache;
    use crate::config::Config;
    use crate::events::ProgressHub;
    use crate::models::worker::WorkerSessionStatus;

    fn session(status: WorkerSessionStatus, worker_id: Option<Uuid>) -> WorkerSessionRow {
        WorkerSessionRow {
            id: Uuid::new_v4(),
            auto_application_id: Uuid::new_v4(),
            status,
            worker_id,
            automation_session_id: None,
            queued_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            worker_notes: None,
            fail_reason: None,
            skip_reason: None,
        }
    }

    #[test]
    fn test_assigned_worker_may_act() {
        let worker = Uuid::new_v4();
        let s = session(WorkerSessionStatus::ReadyForSubmit, Some(worker));
        assert!(authorize_terminal(&s, worker).is_ok());
    }

    #[test]
    fn test_other_worker_is_forbidden() {
        let s = session(WorkerSessionStatus::Assigned, Some(Uuid::new_v4()));
        let result = authorize_terminal(&s, Uuid::new_v4());
        assert!(matches!(result, Err(AppError::Forbidden)));
    }

    #[test]
    fn test_unassigned_session_is_forbidden() {
        let s = session(WorkerSessionStatus::Queued, None);
        assert!(matches!(
            authorize_terminal(&s, Uuid::new_v4()),
            Err(AppError::Forbidden)
        ));
    }

    #[test]
    fn test_terminal_session_conflicts() {
        let worker = Uuid::new_v4();
        let s = session(WorkerSessionStatus::Completed, Some(worker));
        match authorize_terminal(&s, worker) {
            Err(AppError::Conflict(msg)) => assert!(msg.contains("COMPLETED")),
            other => panic!("expected conflict, got {other:?}"),
        }
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

    fn test_state(pool: PgPool) -> AppState {
        AppState {
            db: pool,
            broker: None,
            driver: Arc::new(HttpBrowserDriver::new("http://127.0.0.1:9102".to_string())),
            captcha: CaptchaClient::new(
                "http://127.0.0.1:9103".to_string(),
                "test-key".to_string(),
            ),
            mailbox: MailboxClient::new("http://127.0.0.1:9104".to_string()),
            hub: Arc::new(ProgressHub::new()),
            platform_cache: Arc::new(Mutex::new(BoundedCache::new(16))),
            config: test_config(),
        }
    }

    /// Needs a running PostgreSQL pointed to by DATABASE_URL.
    /// Run with: cargo test test_complete_session_with_advanced_parent -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_complete_session_with_advanced_parent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::db::create_pool(&url).await.expect("pool + migrations");
        let state = test_state(pool.clone());

        // A parent that already reached SUBMITTED out of band, with the
        // worker session still open against it.
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO aggregated_jobs (id, apply_url, ats_type, ai_applyable) VALUES ($1, $2, 'LEVER', TRUE)",
        )
        .bind(job_id)
        .bind("https://jobs.lever.co/acme/42/apply")
        .execute(&pool)
        .await
        .unwrap();
        let application_id: Uuid = sqlx::query_scalar(
            "INSERT INTO auto_applications (user_id, job_id, status) VALUES ($1, $2, 'SUBMITTED') RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        let worker_id: Uuid = sqlx::query_scalar(
            "INSERT INTO workers (email, password_hash, name) VALUES ($1, 'x', 'Queue Tester') RETURNING id",
        )
        .bind(format!("{}@example.com", Uuid::new_v4()))
        .fetch_one(&pool)
        .await
        .unwrap();
        let session_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO worker_sessions (auto_application_id, status, worker_id, assigned_at)
            VALUES ($1, 'ASSIGNED', $2, NOW())
            RETURNING id
            "#,
        )
        .bind(application_id)
        .bind(worker_id)
        .fetch_one(&pool)
        .await
        .unwrap();

        let mut watcher = state.hub.subscribe(application_id);
        let done = complete_session(&state, session_id, worker_id, None)
            .await
            .unwrap();
        assert_eq!(done.status, WorkerSessionStatus::Completed);

        // Parent untouched, operator still credited, no done event faked.
        let (status, method): (ApplicationStatus, Option<ApplyMethod>) =
            sqlx::query_as("SELECT status, method FROM auto_applications WHERE id = $1")
                .bind(application_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, ApplicationStatus::Submitted);
        assert!(method.is_none());

        let credited: i32 = sqlx::query_scalar("SELECT total_completed FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(credited, 1);
        assert!(watcher.try_recv().is_err());
    }
}
