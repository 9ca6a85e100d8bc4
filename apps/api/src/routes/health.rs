use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::automation::captcha::balance_is_low;
use crate::state::AppState;

/// GET /health
/// Reports service status plus the dispatch mode, queue depths, and the
/// captcha provider balance so a drained account is visible before
/// submissions start failing.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let queue = match &state.broker {
        Some(broker) => match broker.depths().await {
            Ok((pending, processing)) => json!({
                "mode": "queued",
                "pending": pending,
                "processing": processing,
            }),
            Err(e) => json!({
                "mode": "queued",
                "error": e.to_string(),
            }),
        },
        None => json!({ "mode": "direct" }),
    };

    let captcha = match state.captcha.balance().await {
        Ok(balance) => {
            let low = balance_is_low(balance, state.config.captcha_low_balance_threshold);
            if low {
                warn!(
                    balance,
                    threshold = state.config.captcha_low_balance_threshold,
                    "Captcha provider balance below threshold"
                );
            }
            json!({ "balance": balance, "low_balance": low })
        }
        Err(e) => json!({ "error": e.to_string() }),
    };

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "service": "autoapply-api",
        "database": db_ok,
        "queue": queue,
        "captcha": captcha,
    }))
}
