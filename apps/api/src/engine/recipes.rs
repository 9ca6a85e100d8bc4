//! Recipe store: versioned automation scripts per ATS platform.
//!
//! Recipes are shared, concurrently-written rows. All statistics updates
//! are single UPDATE statements whose right-hand sides read the old column
//! values, so concurrent executors never lose counts to read-modify-write
//! races. Successes are derivable as `times_used - failure_count`.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::stats;
use crate::models::recipe::{ApplicationRecipeRow, RecipeMethod};

pub async fn fetch_by_platform(
    pool: &PgPool,
    platform: &str,
) -> Result<Option<ApplicationRecipeRow>, sqlx::Error> {
    sqlx::query_as::<_, ApplicationRecipeRow>(
        "SELECT * FROM application_recipes WHERE platform = $1",
    )
    .bind(platform)
    .fetch_optional(pool)
    .await
}

/// Fetches the platform's recipe if it exists and has not been retired by
/// the success-rate floor. A retired recipe stays in storage (history and
/// stats survive) but is skipped for replay until re-recorded.
pub async fn select_for_replay(
    pool: &PgPool,
    platform: &str,
    cfg: &Config,
) -> Result<Option<ApplicationRecipeRow>, sqlx::Error> {
    let recipe = fetch_by_platform(pool, platform).await?;
    Ok(recipe.filter(|r| {
        !stats::should_retire(
            r.success_rate,
            r.times_used,
            cfg.recipe_retirement_floor,
            cfg.recipe_min_sample,
        )
    }))
}

/// Persists a freshly recorded step sequence, bumping the version and
/// resetting statistics when the platform already had a recipe. The
/// recording itself counts as the first successful execution; `recorded_by`
/// identifies the automation session that produced the steps.
pub async fn save_recording(
    pool: &PgPool,
    platform: &str,
    ats_type: &str,
    steps: &Value,
    recorded_by: Option<&str>,
    cfg: &Config,
) -> Result<ApplicationRecipeRow, sqlx::Error> {
    sqlx::query_as::<_, ApplicationRecipeRow>(
        r#"
        INSERT INTO application_recipes
            (platform, ats_type, version, steps, times_used, failure_count,
             success_rate, recording_cost, replay_cost, recorded_by, last_used)
        VALUES ($1, $2, 1, $3, 1, 0, 1.0, $4, $5, $6, NOW())
        ON CONFLICT (platform) DO UPDATE
        SET version = application_recipes.version + 1,
            ats_type = EXCLUDED.ats_type,
            steps = EXCLUDED.steps,
            times_used = 1,
            failure_count = 0,
            success_rate = 1.0,
            recording_cost = EXCLUDED.recording_cost,
            replay_cost = EXCLUDED.replay_cost,
            recorded_by = EXCLUDED.recorded_by,
            last_used = NOW(),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(platform)
    .bind(ats_type)
    .bind(steps)
    .bind(cfg.recording_cost)
    .bind(cfg.replay_cost)
    .bind(recorded_by)
    .fetch_one(pool)
    .await
}

/// One successful replay: bump usage, recompute the cumulative rate, and
/// accumulate the saving over a recording pass.
pub async fn record_replay_success(
    pool: &PgPool,
    recipe_id: Uuid,
    saving: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE application_recipes
        SET times_used = times_used + 1,
            success_rate = (times_used + 1 - failure_count)::float8 / (times_used + 1),
            total_saved = total_saved + $2,
            last_used = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(recipe_id)
    .bind(saving)
    .execute(pool)
    .await?;
    Ok(())
}

/// One failed execution against the recipe. Decays the rate; enough of
/// these push it under the retirement floor.
pub async fn record_recipe_failure(pool: &PgPool, recipe_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE application_recipes
        SET times_used = times_used + 1,
            failure_count = failure_count + 1,
            success_rate = (times_used - failure_count)::float8 / (times_used + 1),
            last_failure = NOW(),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(recipe_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Append-only audit entry for one execution attempt.
pub struct ExecutionLog<'a> {
    pub recipe_id: Option<Uuid>,
    pub success: bool,
    pub method: RecipeMethod,
    pub duration_ms: i64,
    pub cost: f64,
    pub error: Option<&'a str>,
    pub error_type: Option<&'a str>,
    pub job_url: &'a str,
}

pub async fn log_execution(pool: &PgPool, entry: ExecutionLog<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO recipe_executions
            (recipe_id, success, method, duration_ms, cost, error, error_type, job_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.recipe_id)
    .bind(entry.success)
    .bind(entry.method)
    .bind(entry.duration_ms)
    .bind(entry.cost)
    .bind(entry.error)
    .bind(entry.error_type)
    .bind(entry.job_url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recomputes the stored rate over the trailing window of execution log
/// entries. Only called when a window is configured; window 0 keeps the
/// cumulative rate maintained by the atomic updates above.
pub async fn refresh_windowed_rate(
    pool: &PgPool,
    recipe_id: Uuid,
    window: i64,
) -> Result<(), sqlx::Error> {
    let outcomes: Vec<bool> = sqlx::query_scalar(
        r#"
        SELECT success FROM recipe_executions
        WHERE recipe_id = $1
        ORDER BY executed_at DESC
        LIMIT $2
        "#,
    )
    .bind(recipe_id)
    .bind(window)
    .fetch_all(pool)
    .await?;

    sqlx::query("UPDATE application_recipes SET success_rate = $2, updated_at = NOW() WHERE id = $1")
        .bind(recipe_id)
        .bind(stats::windowed_rate(&outcomes))
        .execute(pool)
        .await?;
    Ok(())
}
