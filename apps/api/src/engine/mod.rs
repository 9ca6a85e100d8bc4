//! Application executor: the replay-or-record pipeline.
//!
//! One invocation processes one application attempt end to end:
//!
//! 1. Claim the record (QUEUED|RETRYING → APPLYING, conditional update).
//! 2. Re-check the job, the apply URL, and the profile; stale inputs fail
//!    terminally instead of burning automation spend.
//! 3. Prefer replaying the platform's cached recipe; fall back to a full
//!    AI recording pass in the same attempt when replay fails or no
//!    usable recipe exists.
//! 4. On failure, retry through RETRYING until `max_retries` attempts are
//!    spent, then escalate to the worker-assisted queue instead of
//!    failing outright.
//!
//! No lock is held across driver calls; every transition is its own
//! conditional write.

use std::time::Instant;

use anyhow::{anyhow, Result};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::applications::lifecycle;
use crate::applications::target::validate_target;
use crate::assist;
use crate::automation::mailbox;
use crate::automation::{DriveOutcome, DriveStatus, DriverError};
use crate::config::Config;
use crate::dispatch;
use crate::errors::AppError;
use crate::events::{ProgressStage, StatusEvent};
use crate::models::application::{ApplicationStatus, ApplyMethod};
use crate::models::profile::ApplicationData;
use crate::models::recipe::RecipeMethod;
use crate::state::AppState;

pub mod platform;
pub mod recipes;
pub mod stats;

use recipes::ExecutionLog;

/// How far back the mailbox is searched for a confirmation email.
const CONFIRMATION_WINDOW_MINUTES: u32 = 15;

/// What to do with an application after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry,
    Escalate,
}

/// `retry_count` is the number of failed attempts including the one just
/// recorded; once it reaches `max_retries` the application goes to a human.
pub fn decide_outcome(retry_count: i32, max_retries: i32) -> FailureDisposition {
    if retry_count < max_retries {
        FailureDisposition::Retry
    } else {
        FailureDisposition::Escalate
    }
}

/// Entry point for both dispatch modes. Never panics or bubbles errors;
/// an infrastructure failure is logged and the attempt is abandoned for
/// redelivery to pick up.
pub async fn execute_application(state: &AppState, application_id: Uuid) {
    if let Err(e) = run(state, application_id).await {
        error!("Executor error for application {application_id}: {e:?}");
    }
}

async fn run(state: &AppState, id: Uuid) -> Result<()> {
    let db = &state.db;
    let cfg = &state.config;

    // 1. Claim. Losing here means the record was cancelled or another
    //    consumer already has it.
    if !lifecycle::mark_applying(db, id).await? {
        debug!("Application {id} not claimable; skipping");
        return Ok(());
    }
    let app = lifecycle::fetch_application(db, id)
        .await?
        .ok_or_else(|| anyhow!("claimed application {id} vanished"))?;
    state.hub.progress(id, ProgressStage::Applying, "execution started");

    // 2. The job may have changed since the request was accepted.
    let job = match lifecycle::fetch_job(db, app.job_id).await? {
        Some(job) => job,
        None => {
            return fail_terminal(state, id, None, "Job record no longer exists", "JOB_UNAVAILABLE")
                .await
        }
    };
    if let Some(reason) = lifecycle::job_eligibility_error(&job) {
        return fail_terminal(state, id, Some(&job.apply_url), reason, "JOB_UNAVAILABLE").await;
    }

    // 3. Platform-capability short circuit: too complex goes straight to
    //    a human, no retry consumed.
    if job.is_too_complex() {
        return escalate(
            state,
            id,
            Some("ATS flagged too complex for automation"),
            Some("ATS_TOO_COMPLEX"),
        )
        .await;
    }

    // 4. Trust check again at execution time; the stored URL could have
    //    been rewritten since admission.
    let verdict = validate_target(&job.apply_url);
    if !verdict.valid {
        let reason = verdict
            .error
            .unwrap_or_else(|| "apply URL failed validation".to_string());
        return fail_terminal(state, id, Some(&job.apply_url), &reason, "INVALID_TARGET").await;
    }

    // 5. Profile, already normalized to the canonical shape.
    let applicant = match lifecycle::load_application_data(db, app.user_id).await {
        Ok(Some(data)) if data.is_complete() => data,
        Ok(_) => {
            return fail_terminal(
                state,
                id,
                Some(&job.apply_url),
                "Application profile is missing or incomplete",
                "PROFILE_INVALID",
            )
            .await
        }
        Err(AppError::Validation(msg)) => {
            return fail_terminal(state, id, Some(&job.apply_url), &msg, "PROFILE_INVALID").await
        }
        Err(e) => return Err(anyhow::Error::new(e)),
    };

    // 6. Resolve the platform and look for a live recipe.
    let platform =
        platform::detect_platform(&state.platform_cache, &job.apply_url, &job.ats_type);
    let recipe = recipes::select_for_replay(db, &platform, cfg).await?;

    let mut spent = 0.0;

    // 7. Replay pass.
    if let Some(recipe) = &recipe {
        state.hub.progress(
            id,
            ProgressStage::Replay,
            format!("replaying {platform} recipe v{}", recipe.version),
        );
        let started = Instant::now();
        spent += recipe.replay_cost;
        let outcome = drive_pass(state, id, &job.apply_url, &applicant, Pass::Replay(recipe)).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(o) if o.status == DriveStatus::Submitted => {
                recipes::record_replay_success(
                    db,
                    recipe.id,
                    stats::replay_saving(recipe.recording_cost, recipe.replay_cost),
                )
                .await?;
                recipes::log_execution(
                    db,
                    ExecutionLog {
                        recipe_id: Some(recipe.id),
                        success: true,
                        method: RecipeMethod::Replay,
                        duration_ms,
                        cost: recipe.replay_cost,
                        error: None,
                        error_type: None,
                        job_url: &job.apply_url,
                    },
                )
                .await?;
                maybe_refresh_window(db, recipe.id, cfg).await?;
                return finish_submitted(state, id, &job.apply_url, o, spent).await;
            }
            Ok(o) => {
                // Driver executed and the recipe did not work: that is
                // evidence against the recipe. Fall through to recording.
                let error = o
                    .error
                    .unwrap_or_else(|| "replay did not reach submission".to_string());
                let error_type = o
                    .error_type
                    .unwrap_or_else(|| "REPLAY_MISMATCH".to_string());
                warn!(
                    "Replay of {platform} v{} failed for application {id}: {error}",
                    recipe.version
                );
                recipes::record_recipe_failure(db, recipe.id).await?;
                recipes::log_execution(
                    db,
                    ExecutionLog {
                        recipe_id: Some(recipe.id),
                        success: false,
                        method: RecipeMethod::Replay,
                        duration_ms,
                        cost: recipe.replay_cost,
                        error: Some(&error),
                        error_type: Some(&error_type),
                        job_url: &job.apply_url,
                    },
                )
                .await?;
                maybe_refresh_window(db, recipe.id, cfg).await?;
            }
            Err(e) => {
                // Transport-level failure says nothing about recipe
                // quality; recording would hit the same wall, so the
                // attempt ends here.
                recipes::log_execution(
                    db,
                    ExecutionLog {
                        recipe_id: Some(recipe.id),
                        success: false,
                        method: RecipeMethod::Replay,
                        duration_ms,
                        cost: recipe.replay_cost,
                        error: Some(&e.to_string()),
                        error_type: Some(e.error_type()),
                        job_url: &job.apply_url,
                    },
                )
                .await?;
                return handle_attempt_failure(state, id, e.to_string(), e.error_type().to_string())
                    .await;
            }
        }
    }

    // 8. Recording pass: full AI-driven analysis of the form.
    state
        .hub
        .progress(id, ProgressStage::Recording, "running full AI recording pass");
    let started = Instant::now();
    spent += cfg.recording_cost;
    let outcome = drive_pass(state, id, &job.apply_url, &applicant, Pass::Record).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(o) if o.status == DriveStatus::Submitted => {
            let recipe_id = match &o.steps {
                Some(steps) => {
                    let saved = recipes::save_recording(
                        db,
                        &platform,
                        &job.ats_type,
                        steps,
                        o.session_id.as_deref(),
                        cfg,
                    )
                    .await?;
                    info!(
                        "Recorded {platform} recipe v{} from application {id}",
                        saved.version
                    );
                    Some(saved.id)
                }
                None => {
                    warn!("Recording pass for {platform} returned no steps; nothing cached");
                    None
                }
            };
            recipes::log_execution(
                db,
                ExecutionLog {
                    recipe_id,
                    success: true,
                    method: RecipeMethod::Recording,
                    duration_ms,
                    cost: cfg.recording_cost,
                    error: None,
                    error_type: None,
                    job_url: &job.apply_url,
                },
            )
            .await?;
            finish_submitted(state, id, &job.apply_url, o, spent).await
        }
        Ok(o) => {
            let error = o
                .error
                .unwrap_or_else(|| "recording pass did not reach submission".to_string());
            let error_type = o.error_type.unwrap_or_else(|| "PAGE_LOAD".to_string());
            recipes::log_execution(
                db,
                ExecutionLog {
                    recipe_id: None,
                    success: false,
                    method: RecipeMethod::Recording,
                    duration_ms,
                    cost: cfg.recording_cost,
                    error: Some(&error),
                    error_type: Some(&error_type),
                    job_url: &job.apply_url,
                },
            )
            .await?;
            handle_attempt_failure(state, id, error, error_type).await
        }
        Err(e) => {
            recipes::log_execution(
                db,
                ExecutionLog {
                    recipe_id: None,
                    success: false,
                    method: RecipeMethod::Recording,
                    duration_ms,
                    cost: cfg.recording_cost,
                    error: Some(&e.to_string()),
                    error_type: Some(e.error_type()),
                    job_url: &job.apply_url,
                },
            )
            .await?;
            handle_attempt_failure(state, id, e.to_string(), e.error_type().to_string()).await
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver passes
// ─────────────────────────────────────────────────────────────────────────────

enum Pass<'a> {
    Replay(&'a crate::models::recipe::ApplicationRecipeRow),
    Record,
}

async fn drive_once(
    state: &AppState,
    apply_url: &str,
    applicant: &ApplicationData,
    pass: &Pass<'_>,
    captcha_token: Option<&str>,
) -> Result<DriveOutcome, DriverError> {
    match pass {
        Pass::Replay(recipe) => {
            state
                .driver
                .replay(apply_url, &recipe.steps, applicant, captcha_token)
                .await
        }
        Pass::Record => state.driver.record(apply_url, applicant, captcha_token).await,
    }
}

/// Runs one driver pass, solving at most one CAPTCHA wall. A challenge
/// that survives a solve attempt becomes a CAPTCHA_UNSOLVED failure; the
/// retry/escalate decision happens upstream.
async fn drive_pass(
    state: &AppState,
    id: Uuid,
    apply_url: &str,
    applicant: &ApplicationData,
    pass: Pass<'_>,
) -> Result<DriveOutcome, DriverError> {
    let first = drive_once(state, apply_url, applicant, &pass, None).await?;
    if first.status != DriveStatus::CaptchaRequired {
        return Ok(first);
    }

    // The driver parks a session on the challenge page; release it before
    // re-driving from scratch with the token.
    if let Some(session_id) = &first.session_id {
        if let Err(e) = state.driver.close_session(session_id).await {
            warn!("Failed to close captcha-parked session {session_id}: {e}");
        }
    }

    let Some(challenge) = first.challenge else {
        return Ok(DriveOutcome::failure(
            "driver reported a captcha without challenge details",
            "CAPTCHA_UNSOLVED",
        ));
    };

    state.hub.progress(
        id,
        ProgressStage::Captcha,
        format!("solving {} challenge", challenge.provider),
    );
    let token = match state.captcha.solve(&challenge).await {
        Ok(token) => token,
        Err(e) => {
            return Ok(DriveOutcome::failure(
                format!("captcha solve failed: {e}"),
                "CAPTCHA_UNSOLVED",
            ))
        }
    };

    let second = drive_once(state, apply_url, applicant, &pass, Some(&token)).await?;
    if second.status == DriveStatus::CaptchaRequired {
        if let Some(session_id) = &second.session_id {
            if let Err(e) = state.driver.close_session(session_id).await {
                warn!("Failed to close captcha-parked session {session_id}: {e}");
            }
        }
        return Ok(DriveOutcome::failure(
            "captcha challenge persisted after solve",
            "CAPTCHA_UNSOLVED",
        ));
    }
    Ok(second)
}

// ─────────────────────────────────────────────────────────────────────────────
// Terminal paths
// ─────────────────────────────────────────────────────────────────────────────

async fn finish_submitted(
    state: &AppState,
    id: Uuid,
    apply_url: &str,
    outcome: DriveOutcome,
    spent: f64,
) -> Result<()> {
    let confirmation_url = outcome.confirmation_url;
    let confirmation_id = outcome.confirmation_id;
    let mut confirmation_data = outcome.confirmation_data;

    // Some platforms submit silently; look for the confirmation email.
    if confirmation_url.is_none() && confirmation_id.is_none() && confirmation_data.is_none() {
        state.hub.progress(
            id,
            ProgressStage::Confirmation,
            "searching mailbox for confirmation email",
        );
        if let Some(domain) = mailbox::sender_domain_for(apply_url) {
            match state
                .mailbox
                .search_recent(&domain, CONFIRMATION_WINDOW_MINUTES)
                .await
            {
                Ok(matches) => confirmation_data = mailbox::confirmation_from(&matches),
                Err(e) => warn!("Confirmation mailbox search failed for application {id}: {e}"),
            }
        }
    }

    let updated = lifecycle::mark_submitted(
        &state.db,
        id,
        ApplyMethod::AiAuto,
        confirmation_url.as_deref(),
        confirmation_id.as_deref(),
        confirmation_data.as_ref(),
        spent,
    )
    .await?;
    if !updated {
        warn!("Application {id} was not APPLYING at submission bookkeeping");
        return Ok(());
    }

    info!("Application {id} submitted automatically (spend {spent:.2})");
    state.hub.emit(
        id,
        StatusEvent::Done {
            status: ApplicationStatus::Submitted,
        },
    );
    Ok(())
}

async fn handle_attempt_failure(
    state: &AppState,
    id: Uuid,
    error: String,
    error_type: String,
) -> Result<()> {
    let Some((retry_count, max_retries)) =
        lifecycle::record_attempt_failure(&state.db, id, &error, &error_type).await?
    else {
        warn!("Application {id} left APPLYING before failure bookkeeping");
        return Ok(());
    };

    match decide_outcome(retry_count, max_retries) {
        FailureDisposition::Retry => {
            lifecycle::mark_retrying(&state.db, id).await?;
            state.hub.progress(
                id,
                ProgressStage::RetryScheduled,
                format!("attempt {retry_count}/{max_retries} failed: {error}"),
            );
            info!("Application {id} attempt {retry_count}/{max_retries} failed; redispatching");
            dispatch::redispatch(state, id, retry_count as u32).await;
            Ok(())
        }
        FailureDisposition::Escalate => {
            state.hub.emit(
                id,
                StatusEvent::Error {
                    error_type: error_type.clone(),
                    message: error.clone(),
                },
            );
            info!("Application {id} exhausted {max_retries} attempts; escalating to worker queue");
            escalate(state, id, None, None).await
        }
    }
}

/// Parks the application in MANUAL_REQUIRED and enqueues a worker session.
/// `reason` is set for the too-complex short circuit; retry exhaustion
/// passes `None` because the last failure is already on the row.
async fn escalate(
    state: &AppState,
    id: Uuid,
    reason: Option<&str>,
    error_type: Option<&str>,
) -> Result<()> {
    if !lifecycle::mark_manual_required(&state.db, id, reason, error_type).await? {
        warn!("Application {id} was not APPLYING at escalation");
        return Ok(());
    }
    assist::queue::enqueue_session(&state.db, id).await?;
    state.hub.progress(
        id,
        ProgressStage::Escalated,
        "queued for worker-assisted submission",
    );
    state.hub.emit(
        id,
        StatusEvent::Done {
            status: ApplicationStatus::ManualRequired,
        },
    );
    Ok(())
}

async fn fail_terminal(
    state: &AppState,
    id: Uuid,
    apply_url: Option<&str>,
    reason: &str,
    error_type: &str,
) -> Result<()> {
    let error = match apply_url {
        Some(url) => format!("{reason}; you can complete this application manually at {url}"),
        None => reason.to_string(),
    };
    if !lifecycle::mark_failed(&state.db, id, &error, error_type).await? {
        warn!("Application {id} was not APPLYING at failure bookkeeping");
        return Ok(());
    }
    state.hub.emit(
        id,
        StatusEvent::Error {
            error_type: error_type.to_string(),
            message: error,
        },
    );
    state.hub.emit(
        id,
        StatusEvent::Done {
            status: ApplicationStatus::Failed,
        },
    );
    Ok(())
}

async fn maybe_refresh_window(db: &PgPool, recipe_id: Uuid, cfg: &Config) -> Result<(), sqlx::Error> {
    if cfg.recipe_stats_window > 0 {
        recipes::refresh_windowed_rate(db, recipe_id, cfg.recipe_stats_window).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_below_max_retry() {
        assert_eq!(decide_outcome(1, 3), FailureDisposition::Retry);
        assert_eq!(decide_outcome(2, 3), FailureDisposition::Retry);
    }

    #[test]
    fn test_final_attempt_escalates_instead_of_failing() {
        assert_eq!(decide_outcome(3, 3), FailureDisposition::Escalate);
        // Counter past the cap (manual edits, lowered config) still escalates.
        assert_eq!(decide_outcome(7, 3), FailureDisposition::Escalate);
    }

    #[test]
    fn test_single_attempt_budget() {
        assert_eq!(decide_outcome(1, 1), FailureDisposition::Escalate);
    }
}
