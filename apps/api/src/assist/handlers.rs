use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::Argon2;
use serde::Deserialize;
use uuid::Uuid;

use crate::applications::lifecycle;
use crate::assist::queue::{self, QueueEntry};
use crate::errors::AppError;
use crate::models::application::ApplicationStatus;
use crate::models::worker::{WorkerRole, WorkerRow, WorkerSessionRow};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WorkerIdQuery {
    pub worker_id: Uuid,
}

#[derive(Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/assist/queue
pub async fn handle_list_queue(
    State(state): State<AppState>,
) -> Result<Json<Vec<QueueEntry>>, AppError> {
    let entries = queue::list_queued(&state.db).await?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
pub struct StartNextRequest {
    pub worker_id: Uuid,
}

/// POST /api/v1/assist/queue/start-next
pub async fn handle_start_next(
    State(state): State<AppState>,
    Json(req): Json<StartNextRequest>,
) -> Result<Json<WorkerSessionRow>, AppError> {
    let session = queue::claim_next(&state.db, req.worker_id).await?;
    queue::spawn_prefill(state.clone(), session.id);
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub worker_id: Uuid,
    pub notes: Option<String>,
}

/// POST /api/v1/assist/sessions/:id/complete
pub async fn handle_complete(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<WorkerSessionRow>, AppError> {
    let session = queue::complete_session(&state, session_id, req.worker_id, req.notes).await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub worker_id: Uuid,
    pub reason: String,
}

/// POST /api/v1/assist/sessions/:id/fail
pub async fn handle_fail(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> Result<Json<WorkerSessionRow>, AppError> {
    if req.reason.trim().is_empty() {
        return Err(AppError::Validation("A failure reason is required".to_string()));
    }
    let session = queue::fail_session(&state, session_id, req.worker_id, req.reason).await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
pub struct SkipRequest {
    pub worker_id: Uuid,
    pub reason: Option<String>,
    /// Return the session to the queue for another operator (default)
    /// instead of skipping it permanently.
    #[serde(default = "default_requeue")]
    pub requeue: bool,
}

fn default_requeue() -> bool {
    true
}

/// POST /api/v1/assist/sessions/:id/skip
pub async fn handle_skip(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<SkipRequest>,
) -> Result<Json<WorkerSessionRow>, AppError> {
    let session =
        queue::skip_session(&state, session_id, req.worker_id, req.reason, req.requeue).await?;
    Ok(Json(session))
}

/// GET /api/v1/assist/stats?worker_id=
pub async fn handle_worker_stats(
    State(state): State<AppState>,
    Query(params): Query<WorkerIdQuery>,
) -> Result<Json<WorkerRow>, AppError> {
    let worker = queue::fetch_worker(&state.db, params.worker_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Worker {} not found", params.worker_id)))?;
    Ok(Json(worker))
}

/// GET /api/v1/assist/leaderboard
pub async fn handle_leaderboard(
    State(state): State<AppState>,
    Query(params): Query<LeaderboardQuery>,
) -> Result<Json<Vec<WorkerRow>>, AppError> {
    let limit = params.limit.unwrap_or(10).clamp(1, 100);
    let workers = queue::leaderboard(&state.db, limit).await?;
    Ok(Json(workers))
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ProvisionWorkerRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: Option<WorkerRole>,
}

/// POST /api/v1/admin/workers
pub async fn handle_provision_worker(
    State(state): State<AppState>,
    Json(req): Json<ProvisionWorkerRequest>,
) -> Result<(StatusCode, Json<WorkerRow>), AppError> {
    let email = req.email.trim().to_ascii_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::Validation("A valid email is required".to_string()));
    }
    if req.password.len() < 8 {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".to_string(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("A display name is required".to_string()));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("password hashing failed: {e}")))?
        .to_string();

    let worker = sqlx::query_as::<_, WorkerRow>(
        r#"
        INSERT INTO workers (email, password_hash, name, role)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&email)
    .bind(&password_hash)
    .bind(req.name.trim())
    .bind(req.role.unwrap_or(WorkerRole::Operator))
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::Conflict(format!("A worker with email {email} already exists")))?;

    Ok((StatusCode::CREATED, Json(worker)))
}

#[derive(Deserialize)]
pub struct EnqueueSessionRequest {
    pub application_id: Uuid,
}

/// POST /api/v1/admin/assist-sessions
///
/// Manually puts an application on the worker queue: recreates a lost
/// session for a MANUAL_REQUIRED record, or reopens a FAILED one.
pub async fn handle_admin_enqueue(
    State(state): State<AppState>,
    Json(req): Json<EnqueueSessionRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let app = lifecycle::fetch_application(&state.db, req.application_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("Application {} not found", req.application_id))
        })?;

    match app.status {
        ApplicationStatus::ManualRequired => {}
        ApplicationStatus::Failed => {
            if !lifecycle::reopen_for_manual(&state.db, app.id).await? {
                return Err(AppError::Conflict(
                    "Application advanced before it could be reopened".to_string(),
                ));
            }
        }
        other => {
            return Err(AppError::Conflict(format!(
                "Application is {other}; only MANUAL_REQUIRED or FAILED records can be enqueued"
            )));
        }
    }

    let created = queue::enqueue_session(&state.db, app.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "application_id": app.id,
            "enqueued": created,
        })),
    ))
}
