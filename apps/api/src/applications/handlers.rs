use std::pin::Pin;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::applications::lifecycle::{self, CreateOutcome};
use crate::applications::quota::{self, QuotaSnapshot};
use crate::dispatch::{self, DispatchMode};
use crate::errors::AppError;
use crate::events::StatusEvent;
use crate::models::application::{ApplicationStatus, AutoApplicationRow};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub user_id: Uuid,
    pub job_id: Uuid,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub application: AutoApplicationRow,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DispatchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
}

/// POST /api/v1/applications
///
/// Admission guards run inside `create_application`; a duplicate submit
/// returns the existing record with 200 instead of an error.
pub async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    match lifecycle::create_application(&state.db, &state.config, req.user_id, req.job_id).await? {
        CreateOutcome::Created { application, quota } => {
            let mode = dispatch::dispatch_application(&state, application.id).await;
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    application,
                    duplicate: false,
                    mode: Some(mode),
                    quota: Some(quota),
                }),
            ))
        }
        CreateOutcome::Existing(application) => Ok((
            StatusCode::OK,
            Json(SubmitResponse {
                application,
                duplicate: true,
                mode: None,
                quota: None,
            }),
        )),
    }
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub user_id: Uuid,
    pub status: Option<ApplicationStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/v1/applications
pub async fn handle_list(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<AutoApplicationRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);

    let rows = match params.status {
        Some(status) => {
            sqlx::query_as::<_, AutoApplicationRow>(
                r#"
                SELECT * FROM auto_applications
                WHERE user_id = $1 AND status = $2
                ORDER BY created_at DESC
                LIMIT $3 OFFSET $4
                "#,
            )
            .bind(params.user_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.db)
            .await?
        }
        None => {
            sqlx::query_as::<_, AutoApplicationRow>(
                r#"
                SELECT * FROM auto_applications
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(params.user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&state.db)
            .await?
        }
    };
    Ok(Json(rows))
}

/// GET /api/v1/applications/stats?user_id=
pub async fn handle_stats(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM auto_applications WHERE user_id = $1 GROUP BY status",
    )
    .bind(params.user_id)
    .fetch_all(&state.db)
    .await?;

    let total_cost: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0)::float8 FROM auto_applications WHERE user_id = $1",
    )
    .bind(params.user_id)
    .fetch_one(&state.db)
    .await?;

    let mut by_status = serde_json::Map::new();
    let mut total = 0i64;
    for (status, count) in counts {
        total += count;
        by_status.insert(status, json!(count));
    }

    let quota = quota::check_daily_quota(
        &state.db,
        params.user_id,
        state.config.daily_application_limit,
    )
    .await?;

    Ok(Json(json!({
        "total": total,
        "by_status": by_status,
        "total_cost": total_cost,
        "quota": quota,
    })))
}

/// GET /api/v1/applications/:id?user_id=
pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<AutoApplicationRow>, AppError> {
    let row = lifecycle::fetch_user_application(&state.db, params.user_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Application {id} not found")))?;
    Ok(Json(row))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub user_id: Uuid,
}

/// POST /api/v1/applications/:id/cancel
pub async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<AutoApplicationRow>, AppError> {
    let row = lifecycle::cancel_application(&state.db, req.user_id, id).await?;
    state.hub.emit(
        id,
        StatusEvent::Done {
            status: ApplicationStatus::Cancelled,
        },
    );
    Ok(Json(row))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

/// GET /api/v1/applications/:id/events
///
/// SSE stream of typed progress events. Subscribes before checking status
/// so a transition between the check and the subscription is never lost;
/// a record that is already terminal gets an immediate connected + done
/// pair and the stream ends. Every path that bails out before the live
/// stream starts releases the subscription it opened.
pub async fn handle_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<UserIdQuery>,
) -> Result<Sse<EventStream>, AppError> {
    let rx = state.hub.subscribe(id);

    let app = match lifecycle::fetch_user_application(&state.db, params.user_id, id).await {
        Ok(Some(app)) => app,
        Ok(None) => {
            drop(rx);
            state.hub.release(id);
            return Err(AppError::NotFound(format!("Application {id} not found")));
        }
        Err(e) => {
            drop(rx);
            state.hub.release(id);
            return Err(e.into());
        }
    };

    let connected = StatusEvent::Connected { application_id: id };

    let stream: EventStream = if app.status.is_terminal() {
        drop(rx);
        state.hub.release(id);
        let done = StatusEvent::Done { status: app.status };
        Box::pin(tokio_stream::iter(
            [connected, done]
                .into_iter()
                .map(|e| Event::default().json_data(e)),
        ))
    } else {
        let live = BroadcastStream::new(rx)
            .filter_map(|event| event.ok().map(|e| Event::default().json_data(e)));
        Box::pin(tokio_stream::once(Event::default().json_data(connected)).chain(live))
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
